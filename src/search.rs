//! Similarity-ranked retrieval over the indexed corpus.
//!
//! Read-only: depends solely on the committed state of the stores. The
//! query is embedded with the same model as the corpus (a model mismatch
//! is rejected, never silently compared), nearest neighbors are scored in
//! process over the derived vector index restricted to the permitted
//! document set, and the context is assembled highest-ranked first under
//! a token budget with full provenance per included chunk.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::embedding::{self, blob_to_vec, cosine_similarity, Embedder};
use crate::models::SearchHit;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    /// Tenant scope: only chunks of these documents are searched.
    /// `None` searches the whole corpus.
    pub permitted: Option<Vec<String>>,
    pub top_k: usize,
    pub threshold: f32,
    pub context_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct SearchResponse {
    /// Hits included in the context, ranked by descending score.
    pub hits: Vec<SearchHit>,
    pub context: String,
}

struct Candidate {
    hit: SearchHit,
    token_count: i64,
}

/// Execute one retrieval query. An empty result means no sufficiently
/// relevant chunk exists; the consumer must not fabricate an answer.
pub async fn run_query(
    pool: &SqlitePool,
    embedder: &dyn Embedder,
    request: &SearchRequest,
) -> Result<SearchResponse> {
    if request.query.trim().is_empty() {
        return Ok(SearchResponse {
            hits: Vec::new(),
            context: String::new(),
        });
    }

    // Reject mismatched-model corpora outright.
    let models: Vec<String> = sqlx::query_scalar("SELECT DISTINCT model FROM chunk_vectors")
        .fetch_all(pool)
        .await?;
    for model in &models {
        if model != embedder.model_name() {
            bail!(
                "corpus was embedded with model '{}' but the query embedder is '{}'; \
                 run `acx embed pending` after a rebuild instead of mixing models",
                model,
                embedder.model_name()
            );
        }
    }

    let query_vec = embedding::embed_single(embedder, &request.query).await?;

    let mut sql = String::from(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               c.chunk_index, c.text, c.token_count,
               a.article_number, d.name AS document_name
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        JOIN articles a ON a.id = cv.article_id
        JOIN documents d ON d.id = cv.document_id
        "#,
    );
    if let Some(permitted) = &request.permitted {
        if permitted.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                context: String::new(),
            });
        }
        let placeholders = vec!["?"; permitted.len()].join(", ");
        sql.push_str(&format!("WHERE cv.document_id IN ({})", placeholders));
    }

    let mut query = sqlx::query(&sql);
    if let Some(permitted) = &request.permitted {
        for id in permitted {
            query = query.bind(id);
        }
    }
    let rows = query.fetch_all(pool).await?;

    let candidates: Vec<Candidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(&query_vec, &blob_to_vec(&blob));
            Candidate {
                hit: SearchHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    document_name: row.get("document_name"),
                    article_number: row.get("article_number"),
                    chunk_index: row.get("chunk_index"),
                    score,
                    text: row.get("text"),
                },
                token_count: row.get("token_count"),
            }
        })
        .collect();

    let ranked = rank(candidates, request.threshold, request.top_k);
    let (hits, context) = assemble_context(ranked, request.context_tokens);

    Ok(SearchResponse { hits, context })
}

/// Threshold filter + descending sort + top-k cut. Deterministic: ties
/// break on chunk id.
fn rank(mut candidates: Vec<Candidate>, threshold: f32, top_k: usize) -> Vec<Candidate> {
    candidates.retain(|c| c.hit.score >= threshold);
    candidates.sort_by(|a, b| {
        b.hit
            .score
            .partial_cmp(&a.hit.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.hit.chunk_id.cmp(&b.hit.chunk_id))
    });
    candidates.truncate(top_k);
    candidates
}

/// Greedy prefix under the token budget: include highest-ranked chunks
/// until the next one no longer fits.
fn assemble_context(candidates: Vec<Candidate>, budget_tokens: usize) -> (Vec<SearchHit>, String) {
    let mut hits = Vec::new();
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0usize;

    for candidate in candidates {
        let cost = candidate.token_count.max(0) as usize;
        if used + cost > budget_tokens && !hits.is_empty() {
            break;
        }
        if cost > budget_tokens && hits.is_empty() {
            // Even the best hit exceeds the budget alone; return it anyway
            // so the consumer can truncate rather than get nothing.
            used = budget_tokens;
        } else {
            used += cost;
        }
        parts.push(candidate.hit.text.clone());
        hits.push(candidate.hit);
        if used >= budget_tokens {
            break;
        }
    }

    (hits, parts.join("\n\n"))
}

/// CLI entry: run a query and print ranked, cited results.
pub async fn run_search(
    config: &Config,
    pool: &SqlitePool,
    query: &str,
    documents: Option<String>,
    top_k: Option<usize>,
    threshold: Option<f32>,
    context_tokens: Option<usize>,
) -> Result<()> {
    let Some(embedder) = embedding::create_embedder(&config.embedding)? else {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    };

    let permitted = documents.map(|list| {
        list.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
    });

    let request = SearchRequest {
        query: query.to_string(),
        permitted,
        top_k: top_k.unwrap_or(config.retrieval.top_k),
        threshold: threshold.unwrap_or(config.retrieval.similarity_threshold),
        context_tokens: context_tokens.unwrap_or(config.retrieval.context_token_budget),
    };

    let response = run_query(pool, embedder.as_ref(), &request).await?;

    if response.hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in response.hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / artikel {}",
            i + 1,
            hit.score,
            hit.document_name,
            hit.article_number
        );
        println!("    chunk: {}", hit.chunk_index);
        println!("    excerpt: \"{}\"", excerpt(&hit.text, 240));
        println!("    id: {}", hit.chunk_id);
        println!();
    }

    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.len() <= max_chars {
        return trimmed.to_string();
    }
    let mut end = max_chars;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, score: f32, tokens: i64) -> Candidate {
        Candidate {
            hit: SearchHit {
                chunk_id: id.to_string(),
                document_id: "d1".to_string(),
                document_name: "CAO Metaal".to_string(),
                article_number: "1".to_string(),
                chunk_index: 0,
                score,
                text: format!("chunk {}", id),
            },
            token_count: tokens,
        }
    }

    #[test]
    fn rank_filters_below_threshold() {
        let ranked = rank(
            vec![
                candidate("a", 0.9, 10),
                candidate("b", 0.5, 10),
                candidate("c", 0.7, 10),
            ],
            0.6,
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.hit.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn raising_threshold_never_increases_results() {
        let make = || {
            vec![
                candidate("a", 0.9, 10),
                candidate("b", 0.75, 10),
                candidate("c", 0.61, 10),
                candidate("d", 0.4, 10),
            ]
        };
        let mut previous = usize::MAX;
        for threshold in [0.0f32, 0.5, 0.62, 0.8, 0.95] {
            let count = rank(make(), threshold, 10).len();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn rank_respects_top_k() {
        let ranked = rank(
            vec![
                candidate("a", 0.9, 10),
                candidate("b", 0.8, 10),
                candidate("c", 0.7, 10),
            ],
            0.0,
            2,
        );
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].hit.chunk_id, "a");
    }

    #[test]
    fn ties_break_deterministically() {
        let a = rank(
            vec![candidate("b", 0.8, 10), candidate("a", 0.8, 10)],
            0.0,
            10,
        );
        assert_eq!(a[0].hit.chunk_id, "a");
    }

    #[test]
    fn context_stops_at_budget() {
        let (hits, context) = assemble_context(
            vec![
                candidate("a", 0.9, 100),
                candidate("b", 0.8, 100),
                candidate("c", 0.7, 100),
            ],
            250,
        );
        assert_eq!(hits.len(), 2);
        assert!(context.contains("chunk a"));
        assert!(context.contains("chunk b"));
        assert!(!context.contains("chunk c"));
    }

    #[test]
    fn oversized_top_hit_still_returned() {
        let (hits, _) = assemble_context(vec![candidate("a", 0.9, 5000)], 100);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_candidates_yield_empty_context() {
        let (hits, context) = assemble_context(Vec::new(), 100);
        assert!(hits.is_empty());
        assert!(context.is_empty());
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        let text = "é".repeat(300);
        let out = excerpt(&text, 240);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 244);
    }
}
