//! Text tokenization for the inverted index (§4.13).
//!
//! Simpler than a full-text search engine: no stemming, no ranking.
//! Lowercase, strip non-alphanumeric characters, split on Unicode word
//! boundaries, drop tokens shorter than two characters and a small
//! language-agnostic stopword list.

use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Tokenize `text` into lowercase, punctuation-stripped terms, with
/// stopwords removed. Preserves duplicates so posting-list term
/// frequency could be derived later; callers that only need set
/// membership should dedupe themselves.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .map(|w| w.to_lowercase())
        .filter(|s| s.len() >= 2)
        .filter(|s| !is_stopword(s))
        .collect()
}

/// Distinct terms in `text`, order-preserving.
pub fn tokenize_unique(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text).into_iter().filter(|t| seen.insert(t.clone())).collect()
}
