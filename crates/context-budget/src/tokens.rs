//! Token counting
//!
//! BPE encodings are loaded lazily once per process (loading takes a couple
//! hundred milliseconds). If an encoding cannot be loaded, or an unknown
//! tokenizer name is configured, counting falls back to a chars/4 estimate.

use std::fmt;
use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Largest slice handed to the BPE encoder in one call. Merging is quadratic
/// in the length of a run without whitespace, so long text is counted in
/// windows cut at whitespace where possible.
const BPE_WINDOW_BYTES: usize = 2048;

static CL100K_BASE: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K_BASE: OnceLock<Option<CoreBPE>> = OnceLock::new();

type LoadResult = Result<CoreBPE, String>;

fn load(
    cell: &'static OnceLock<Option<CoreBPE>>,
    name: &str,
    loader: fn() -> LoadResult,
) -> Option<&'static CoreBPE> {
    cell.get_or_init(|| match loader() {
        Ok(bpe) => Some(bpe),
        Err(e) => {
            warn!(encoding = name, error = %e, "failed to load tokenizer, using heuristic");
            None
        }
    })
    .as_ref()
}

fn load_cl100k() -> LoadResult {
    tiktoken_rs::cl100k_base().map_err(|e| e.to_string())
}

fn load_o200k() -> LoadResult {
    tiktoken_rs::o200k_base().map_err(|e| e.to_string())
}

/// Token counter used by the budgeter.
#[derive(Clone, Copy)]
pub enum TokenCounter {
    /// BPE encoding shared for the whole process
    Bpe {
        name: &'static str,
        bpe: &'static CoreBPE,
    },
    /// `chars / 4`, monotonic in text length
    Heuristic,
}

impl TokenCounter {
    /// Resolve a configured tokenizer name.
    ///
    /// `cl100k_base` and `o200k_base` select a BPE encoding; `heuristic`
    /// selects the estimate. Anything else, or an encoding that fails to load,
    /// falls back to the estimate.
    pub fn from_name(name: &str) -> Self {
        let loaded = match name {
            "cl100k_base" => load(&CL100K_BASE, "cl100k_base", load_cl100k)
                .map(|bpe| TokenCounter::Bpe {
                    name: "cl100k_base",
                    bpe,
                }),
            "o200k_base" => load(&O200K_BASE, "o200k_base", load_o200k).map(|bpe| {
                TokenCounter::Bpe {
                    name: "o200k_base",
                    bpe,
                }
            }),
            "heuristic" => return TokenCounter::Heuristic,
            other => {
                warn!(tokenizer = other, "unknown tokenizer, using heuristic");
                None
            }
        };
        loaded.unwrap_or(TokenCounter::Heuristic)
    }

    /// Count tokens in `text`. Empty text is always 0.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self {
            TokenCounter::Bpe { bpe, .. } => windows(text, BPE_WINDOW_BYTES)
                .map(|window| bpe.encode_ordinary(window).len())
                .sum(),
            TokenCounter::Heuristic => text.chars().count() / 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TokenCounter::Bpe { name, .. } => *name,
            TokenCounter::Heuristic => "heuristic",
        }
    }
}

/// Split `text` into slices of at most `max_bytes`, cutting before the last
/// whitespace in each slice when there is one.
fn windows(text: &str, max_bytes: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        if rest.len() <= max_bytes {
            return Some(std::mem::take(&mut rest));
        }
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(space) = rest[..cut].rfind(char::is_whitespace).filter(|&i| i > 0) {
            cut = space;
        }
        if cut == 0 {
            // a single character wider than the window
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (window, tail) = rest.split_at(cut);
        rest = tail;
        Some(window)
    })
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenCounter({})", self.name())
    }
}
