//! Small text helpers shared by the index, the embedder and the composer.

use std::collections::BTreeSet;

/// Words that never count as evidence of relevance.
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has", "have", "how",
    "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our",
    "should", "so", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "us", "was", "we", "were", "what", "when", "where", "which", "who", "why",
    "will", "with", "would", "you", "your",
];

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.binary_search(&word).is_ok()
}

/// Distinct non-stopword terms of at least `min_len` characters.
pub fn content_terms(text: &str, min_len: usize) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|w| w.chars().count() >= min_len && !is_stopword(w))
        .collect()
}

/// Number of `question_terms` that also occur in `text`.
pub fn term_overlap(question_terms: &BTreeSet<String>, text: &str, min_len: usize) -> usize {
    let text_terms = content_terms(text, min_len);
    question_terms.intersection(&text_terms).count()
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max.saturating_sub(1)).collect();
    out.truncate(out.trim_end().len());
    out.push('…');
    out
}

/// Split into sentences on `.`, `!`, `?` and newlines. Empty pieces dropped.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let piece = text[start..end].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}
