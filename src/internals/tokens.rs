//! Token estimation fallback for cost accounting.
//!
//! Cost totals come from the usage block in provider responses. When a
//! response carries no usage numbers, the adapter estimates with cl100k_base
//! and marks the provenance `usage_estimated` so cost reports stay honest
//! instead of silently recording zero.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::logging::log_warn;

static BPE: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        log_warn!(
            error = %e,
            "cl100k_base tokenizer unavailable, falling back to char heuristic"
        );
        None
    }
});

/// Estimate the token count of `text`.
///
/// Uses cl100k_base when available; otherwise the chars/4 heuristic. Either
/// way the result is an approximation and callers must flag it as such.
pub fn estimate(text: &str) -> u32 {
    match BPE.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.chars().count() / 4).max(1) as u32,
    }
}
