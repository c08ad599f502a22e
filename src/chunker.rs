//! Semantic chunking with a deterministic fallback.
//!
//! The happy path asks the reasoning capability to propose chunk
//! boundaries aligned with semantic units (clauses, paragraphs of a
//! single obligation). Proposals are validated against the article text:
//! every proposed chunk must be locatable, in order, and within twice the
//! token budget. Otherwise the whole response is discarded.
//!
//! On any proposal failure the fallback splitter takes over: paragraphs
//! are accumulated against the token budget, and a run-on paragraph is
//! force-split at sentence boundaries with the configured overlap. The
//! fallback is a degraded outcome, not a failed one.

use tracing::warn;

use crate::config::ChunkingConfig;
use crate::reasoning::{ChunkProposal, ChunkProposer};

/// Approximate chars-per-token ratio used for all budget math.
pub const CHARS_PER_TOKEN: usize = 4;

pub fn approx_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// One chunk of an article, with offsets into the article text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub text: String,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub reasoning: Option<String>,
}

/// Result of chunking one article.
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub chunks: Vec<ChunkPiece>,
    /// The fallback splitter was used instead of the reasoning capability.
    pub degraded: bool,
}

/// Chunk one article's text.
///
/// Empty text yields zero chunks and is not degraded; the article is
/// simply parsed-empty.
pub async fn chunk_article(
    proposer: &dyn ChunkProposer,
    config: &ChunkingConfig,
    article_text: &str,
) -> ChunkOutcome {
    if article_text.trim().is_empty() {
        return ChunkOutcome {
            chunks: Vec::new(),
            degraded: false,
        };
    }

    match proposer.propose(article_text, config.target_tokens).await {
        Ok(proposals) => {
            if let Some(chunks) = align_proposals(article_text, &proposals, config.target_tokens) {
                return ChunkOutcome {
                    chunks,
                    degraded: false,
                };
            }
            warn!(
                provider = proposer.provider_name(),
                "chunk proposals did not align with article text, using fallback splitter"
            );
        }
        Err(err) => {
            warn!(
                provider = proposer.provider_name(),
                error = %err,
                "reasoning capability unavailable, using fallback splitter"
            );
        }
    }

    ChunkOutcome {
        chunks: fallback_chunks(article_text, config.target_tokens, config.overlap_tokens),
        degraded: true,
    }
}

/// Validate proposals and recover their offsets by walking the article
/// text left to right. Any unlocatable, empty, or oversized proposal
/// rejects the whole response.
fn align_proposals(
    text: &str,
    proposals: &[ChunkProposal],
    target_tokens: usize,
) -> Option<Vec<ChunkPiece>> {
    let mut pieces = Vec::with_capacity(proposals.len());
    let mut cursor = 0usize;

    for proposal in proposals {
        let wanted = proposal.text.trim();
        if wanted.is_empty() || approx_tokens(wanted) > target_tokens * 2 {
            return None;
        }
        let rel = text[cursor..].find(wanted)?;
        let start = cursor + rel;
        let end = start + wanted.len();
        let reasoning = proposal.reasoning.trim();
        pieces.push(ChunkPiece {
            text: wanted.to_string(),
            token_count: approx_tokens(wanted),
            start_offset: start,
            end_offset: end,
            reasoning: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning.to_string())
            },
        });
        cursor = end;
    }

    if pieces.is_empty() {
        None
    } else {
        Some(pieces)
    }
}

/// Deterministic splitter: paragraph accumulation against the token
/// budget, sentence-boundary force-splits for run-on paragraphs.
pub fn fallback_chunks(text: &str, target_tokens: usize, overlap_tokens: usize) -> Vec<ChunkPiece> {
    let max_chars = target_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let mut out = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (para_start, para_end) in paragraph_ranges(text) {
        if para_end - para_start > max_chars {
            if let Some((s, e)) = current.take() {
                push_piece(text, s, e, &mut out);
            }
            force_split(text, para_start, para_end, max_chars, overlap_chars, &mut out);
            continue;
        }

        current = match current {
            None => Some((para_start, para_end)),
            Some((s, e)) => {
                if para_end - s > max_chars {
                    push_piece(text, s, e, &mut out);
                    Some((para_start, para_end))
                } else {
                    Some((s, para_end))
                }
            }
        };
    }

    if let Some((s, e)) = current {
        push_piece(text, s, e, &mut out);
    }
    out
}

/// Ranges of non-empty paragraphs (blank-line separated), trimmed.
fn paragraph_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut cursor = 0usize;
    while cursor < text.len() {
        let end = match text[cursor..].find("\n\n") {
            Some(rel) => cursor + rel,
            None => text.len(),
        };
        if let Some(range) = trimmed_range(text, cursor, end) {
            ranges.push(range);
        }
        cursor = end;
        while cursor < text.len() && text.as_bytes()[cursor] == b'\n' {
            cursor += 1;
        }
    }
    ranges
}

/// Split one oversized paragraph at sentence boundaries, carrying
/// `overlap_chars` of trailing sentences into the next piece.
fn force_split(
    text: &str,
    start: usize,
    end: usize,
    max_chars: usize,
    overlap_chars: usize,
    out: &mut Vec<ChunkPiece>,
) {
    let sentences = sentence_bounds(text, start, end);
    if sentences.is_empty() {
        return;
    }

    let mut i = 0usize;
    loop {
        let piece_start = sentences[i].0;
        let mut j = i;
        while j + 1 < sentences.len() && sentences[j + 1].1 - piece_start <= max_chars {
            j += 1;
        }
        let piece_end = sentences[j].1;

        if piece_end - piece_start > max_chars {
            // A single sentence longer than the whole budget: hard split
            // at whitespace.
            hard_split(text, piece_start, piece_end, max_chars, out);
        } else {
            push_piece(text, piece_start, piece_end, out);
        }

        if j + 1 >= sentences.len() {
            break;
        }

        // Start the next piece at the latest sentence whose distance to the
        // piece end covers the overlap. Forward progress is guaranteed:
        // candidates never go below i + 1, and when no sentence can cover
        // the overlap the next piece simply starts fresh.
        let mut next = j + 1;
        if overlap_chars > 0 {
            for cand in ((i + 1)..=j).rev() {
                if piece_end - sentences[cand].0 >= overlap_chars {
                    next = cand;
                    break;
                }
            }
        }
        i = next;
    }
}

/// Last-resort split of a sentence exceeding the budget on its own.
fn hard_split(text: &str, start: usize, end: usize, max_chars: usize, out: &mut Vec<ChunkPiece>) {
    let mut cursor = start;
    while cursor < end {
        let mut split = (cursor + max_chars).min(end);
        if split < end {
            while !text.is_char_boundary(split) {
                split -= 1;
            }
            if let Some(ws) = text[cursor..split].rfind(char::is_whitespace) {
                if ws > 0 {
                    split = cursor + ws;
                }
            }
        }
        push_piece(text, cursor, split, out);
        cursor = split;
        while cursor < end && !text.is_char_boundary(cursor) {
            cursor += 1;
        }
        while cursor < end
            && text[cursor..]
                .chars()
                .next()
                .map(char::is_whitespace)
                .unwrap_or(false)
        {
            cursor += text[cursor..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
    }
}

/// Sentence ranges within `[start, end)`, split after `.`/`!`/`?`
/// followed by whitespace.
fn sentence_bounds(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut sentence_start = start;
    let slice = &text[start..end];
    let mut chars = slice.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    let abs_end = start + i + ch.len_utf8();
                    if let Some(range) = trimmed_range(text, sentence_start, abs_end) {
                        bounds.push(range);
                    }
                    sentence_start = abs_end;
                }
            }
        }
    }
    if let Some(range) = trimmed_range(text, sentence_start, end) {
        bounds.push(range);
    }
    bounds
}

/// Shrink a range to its trimmed content; `None` when only whitespace.
fn trimmed_range(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lead = slice.len() - slice.trim_start().len();
    Some((start + lead, start + lead + trimmed.len()))
}

fn push_piece(text: &str, start: usize, end: usize, out: &mut Vec<ChunkPiece>) {
    if let Some((s, e)) = trimmed_range(text, start, end) {
        let piece = &text[s..e];
        out.push(ChunkPiece {
            text: piece.to_string(),
            token_count: approx_tokens(piece),
            start_offset: s,
            end_offset: e,
            reasoning: None,
        });
    }
}
