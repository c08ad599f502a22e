//! Reasoning capability client: proposes semantic chunk boundaries.
//!
//! The external service receives one article's text plus the token budget
//! and returns ordered chunks, each with a short reasoning annotation.
//! The client is a long-lived handle constructed once per process and
//! shared across workers; tests substitute a scripted [`ChunkProposer`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ReasoningConfig;

/// One proposed chunk, in article order.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkProposal {
    pub text: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning provider is disabled")]
    Disabled,
    #[error("reasoning request timed out after {0}s")]
    Timeout(u64),
    #[error("reasoning api error: {0}")]
    Api(String),
    #[error("reasoning response invalid: {0}")]
    InvalidResponse(String),
}

/// Boundary-proposal capability. May degrade to unavailable; callers fall
/// back to deterministic splitting on any error.
#[async_trait]
pub trait ChunkProposer: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn propose(
        &self,
        article_text: &str,
        target_tokens: usize,
    ) -> Result<Vec<ChunkProposal>, ReasoningError>;
}

/// Always-unavailable proposer; every article takes the fallback path.
pub struct DisabledProposer;

#[async_trait]
impl ChunkProposer for DisabledProposer {
    fn provider_name(&self) -> &str {
        "disabled"
    }

    async fn propose(
        &self,
        _article_text: &str,
        _target_tokens: usize,
    ) -> Result<Vec<ChunkProposal>, ReasoningError> {
        Err(ReasoningError::Disabled)
    }
}

/// HTTP proposer speaking a chat-completions style JSON contract.
pub struct HttpProposer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl HttpProposer {
    pub fn new(config: &ReasoningConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reasoning.base_url required"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reasoning.model required"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }

    fn prompt(article_text: &str, target_tokens: usize) -> String {
        format!(
            "Split this collective agreement article into semantically coherent \
             chunks of at most {} tokens each. Keep clauses together and do not \
             rewrite any text. Respond with JSON: \
             {{\"chunks\": [{{\"text\": \"...\", \"reasoning\": \"...\"}}]}}\n\n{}",
            target_tokens, article_text
        )
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct ProposalPayload {
    chunks: Vec<ChunkProposal>,
}

#[async_trait]
impl ChunkProposer for HttpProposer {
    fn provider_name(&self) -> &str {
        &self.model
    }

    async fn propose(
        &self,
        article_text: &str,
        target_tokens: usize,
    ) -> Result<Vec<ChunkProposal>, ReasoningError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": Self::prompt(article_text, target_tokens),
            }],
            "response_format": {"type": "json_object"},
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: ChatResponse = response
                            .json()
                            .await
                            .map_err(|e| ReasoningError::InvalidResponse(e.to_string()))?;
                        return parse_proposals(&parsed);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(ReasoningError::Api(format!("{}: {}", status, body_text)));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(ReasoningError::Api(format!("{}: {}", status, body_text)));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(ReasoningError::Timeout(self.timeout_secs));
                    continue;
                }
                Err(e) => {
                    last_err = Some(ReasoningError::Api(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ReasoningError::Api("retries exhausted".to_string())))
    }
}

fn parse_proposals(resp: &ChatResponse) -> Result<Vec<ChunkProposal>, ReasoningError> {
    let content = resp
        .choices
        .first()
        .map(|c| c.message.content.as_str())
        .ok_or_else(|| ReasoningError::InvalidResponse("no choices in response".to_string()))?;

    let payload: ProposalPayload = serde_json::from_str(content)
        .map_err(|e| ReasoningError::InvalidResponse(e.to_string()))?;

    if payload.chunks.is_empty() {
        return Err(ReasoningError::InvalidResponse(
            "empty chunk list".to_string(),
        ));
    }
    Ok(payload.chunks)
}

/// Build the configured proposer. A `disabled` provider still returns a
/// usable handle; chunking then always degrades to the fallback splitter.
pub fn create_proposer(
    config: &ReasoningConfig,
) -> anyhow::Result<std::sync::Arc<dyn ChunkProposer>> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledProposer)),
        "http" => Ok(std::sync::Arc::new(HttpProposer::new(config)?)),
        other => anyhow::bail!("Unknown reasoning provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_proposer_always_errors() {
        let err = DisabledProposer
            .propose("Artikel 1", 300)
            .await
            .unwrap_err();
        assert!(matches!(err, ReasoningError::Disabled));
    }

    #[test]
    fn parse_valid_chat_payload() {
        let resp = ChatResponse {
            choices: vec![ChatChoice {
                message: ChatMessage {
                    content: r#"{"chunks": [{"text": "Het loon.", "reasoning": "wage clause"}]}"#
                        .to_string(),
                },
            }],
        };
        let chunks = parse_proposals(&resp).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Het loon.");
        assert_eq!(chunks[0].reasoning, "wage clause");
    }

    #[test]
    fn empty_chunk_list_is_invalid() {
        let resp = ChatResponse {
            choices: vec![ChatChoice {
                message: ChatMessage {
                    content: r#"{"chunks": []}"#.to_string(),
                },
            }],
        };
        assert!(matches!(
            parse_proposals(&resp),
            Err(ReasoningError::InvalidResponse(_))
        ));
    }

    #[test]
    fn garbage_content_is_invalid() {
        let resp = ChatResponse {
            choices: vec![ChatChoice {
                message: ChatMessage {
                    content: "not json at all".to_string(),
                },
            }],
        };
        assert!(matches!(
            parse_proposals(&resp),
            Err(ReasoningError::InvalidResponse(_))
        ));
    }
}
