//! Splitting oversized text into chunks that each fit a token budget

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tokens::TokenCounter;

/// How oversized text is split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    /// Equal-length character slices, no semantic awareness
    Simple,
    /// Paragraph (then sentence) boundaries, simple split for oversized pieces
    #[default]
    Smart,
}

impl ContextStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStrategy::Simple => "simple",
            ContextStrategy::Smart => "smart",
        }
    }
}

impl fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "simple" | "simple_chunk" => Ok(ContextStrategy::Simple),
            "smart" | "smart_chunk" => Ok(ContextStrategy::Smart),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

/// One piece of a split text. `index < total` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextChunk {
    pub content: String,
    pub token_count: usize,
    pub index: usize,
    pub total: usize,
    pub metadata: BTreeMap<String, String>,
}

/// A piece of text before index/total are known.
struct Piece {
    content: String,
    metadata: BTreeMap<String, String>,
}

impl Piece {
    fn new(content: String, strategy: ContextStrategy) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("strategy".to_string(), strategy.as_str().to_string());
        Self { content, metadata }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Split `text` so that every chunk holds at most `max_tokens` tokens.
///
/// Text that already fits comes back as a single chunk; empty text yields no
/// chunks and any other text yields at least one. A `max_tokens` of 0 is
/// treated as 1.
///
/// Splitting stops at single characters, so a character that alone costs
/// more than `max_tokens` under BPE becomes its own over-budget chunk.
pub fn chunk_text(
    counter: &TokenCounter,
    text: &str,
    max_tokens: usize,
    strategy: ContextStrategy,
) -> Vec<ContextChunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let max_tokens = max_tokens.max(1);

    let pieces = if counter.count(text) <= max_tokens {
        vec![Piece::new(text.to_string(), strategy).with("split", "none")]
    } else {
        match strategy {
            ContextStrategy::Simple => simple_pieces(counter, text, max_tokens, strategy),
            ContextStrategy::Smart => smart_pieces(counter, text, max_tokens),
        }
    };

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| ContextChunk {
            token_count: counter.count(&piece.content),
            content: piece.content,
            index,
            total,
            metadata: piece.metadata,
        })
        .collect()
}

/// Equal-length character slices.
///
/// Cuts the text into `ceil(total / max)` slices, then cuts again only the
/// slices still over budget, since a BPE count of a slice is not proportional
/// to its length. Stops at one character per slice.
fn simple_pieces(
    counter: &TokenCounter,
    text: &str,
    max_tokens: usize,
    strategy: ContextStrategy,
) -> Vec<Piece> {
    let chars: Vec<char> = text.chars().collect();
    let mut ranges = Vec::new();
    split_range(
        counter,
        &chars,
        (0, chars.len()),
        counter.count(text),
        max_tokens,
        &mut ranges,
    );

    ranges
        .into_iter()
        .map(|(start, end)| {
            Piece::new(chars[start..end].iter().collect(), strategy)
                .with("char_range", format!("{start}..{end}"))
        })
        .collect()
}

/// Push `chars[start..end]`, which holds `tokens` tokens, onto `out`, split
/// into equal slices as many times as it takes for each to fit.
fn split_range(
    counter: &TokenCounter,
    chars: &[char],
    (start, end): (usize, usize),
    tokens: usize,
    max_tokens: usize,
    out: &mut Vec<(usize, usize)>,
) {
    let len = end - start;
    if tokens <= max_tokens || len <= 1 {
        out.push((start, end));
        return;
    }

    let slices = tokens.div_ceil(max_tokens).clamp(2, len);
    for i in 0..slices {
        let range = (start + i * len / slices, start + (i + 1) * len / slices);
        let content: String = chars[range.0..range.1].iter().collect();
        split_range(
            counter,
            chars,
            range,
            counter.count(&content),
            max_tokens,
            out,
        );
    }
}

/// Paragraph-aware accumulation.
///
/// Splits on blank lines, or on sentence ends when there are none, and packs
/// consecutive pieces into a buffer until the next one would push it over the
/// budget. A single piece over the budget is split with the simple strategy.
fn smart_pieces(counter: &TokenCounter, text: &str, max_tokens: usize) -> Vec<Piece> {
    let separator = if text.contains("\n\n") { "\n\n" } else { ". " };
    let mut pieces = Vec::new();
    let mut buffer = String::new();

    for part in text.split(separator).filter(|p| !p.is_empty()) {
        if counter.count(part) > max_tokens {
            flush(&mut buffer, &mut pieces);
            pieces.extend(
                simple_pieces(counter, part, max_tokens, ContextStrategy::Smart)
                    .into_iter()
                    .map(|p| p.with("split", "simple")),
            );
            continue;
        }

        if buffer.is_empty() {
            buffer.push_str(part);
            continue;
        }

        let candidate = format!("{buffer}{separator}{part}");
        if counter.count(&candidate) > max_tokens {
            flush(&mut buffer, &mut pieces);
            buffer.push_str(part);
        } else {
            buffer = candidate;
        }
    }
    flush(&mut buffer, &mut pieces);

    // Nothing but separators
    if pieces.is_empty() {
        return simple_pieces(counter, text, max_tokens, ContextStrategy::Smart);
    }
    pieces
}

fn flush(buffer: &mut String, pieces: &mut Vec<Piece>) {
    if !buffer.is_empty() {
        pieces.push(Piece::new(std::mem::take(buffer), ContextStrategy::Smart));
    }
}
