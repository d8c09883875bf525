use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Upper bound on the keyword set of a fingerprint.
pub const MAX_KEYWORDS: usize = 10;

/// Jaccard overlap at or above which two keyword sets count as the same question.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "but", "by", "can", "could", "did", "do", "does", "doing", "dont",
    "during", "each", "else", "ever", "for", "from", "had", "has", "have", "having", "he", "her",
    "here", "him", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "like", "me",
    "more", "most", "my", "no", "not", "now", "of", "on", "one", "or", "other", "our", "out",
    "over", "really", "she", "should", "so", "some", "such", "tell", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "thing", "things", "this", "those",
    "through", "to", "too", "up", "us", "very", "was", "we", "were", "what", "whats", "when",
    "where", "which", "while", "who", "whom", "why", "will", "with", "would", "you", "youd",
    "your", "youre", "yours",
];

/// Case-folds, strips punctuation and collapses whitespace.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex SHA-256 of the normalized form.
pub fn hash_normalized(normalized: &str) -> String {
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Content keywords of a normalized question, in order of appearance.
pub fn keywords(normalized: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    normalized
        .split_whitespace()
        .filter(|word| word.chars().count() > 2 && !STOPWORDS.contains(word))
        .filter(|word| seen.insert(word.to_string()))
        .take(MAX_KEYWORDS)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two keyword sets. Empty sets never match.
pub fn similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

/// The canonical identity of a question.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub normalized: String,
    pub hash: String,
    pub keywords: Vec<String>,
}

impl Fingerprint {
    pub fn of(text: &str) -> Self {
        let normalized = normalize(text);
        Self {
            hash: hash_normalized(&normalized),
            keywords: keywords(&normalized),
            normalized,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }
}
