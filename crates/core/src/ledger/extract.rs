use super::fingerprint::normalize;
use std::collections::HashSet;

/// Finds the questions inside an assistant utterance.
pub trait QuestionExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<String>;
}

const INTERROGATIVES: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "whom", "whose", "which", "do", "did", "does",
    "is", "are", "was", "were", "can", "could", "would", "will", "have", "has", "had", "should",
    "may", "might",
];

/// Imperative openings an interviewer uses in place of a question mark.
const PROMPT_OPENINGS: &[&str] = &[
    "tell me about",
    "tell me more",
    "describe",
    "walk me through",
    "share a",
    "share some",
    "talk about",
    "id love to hear",
    "i would love to hear",
];

/// Sentence segmentation plus question-mark and opening-word markers.
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    min_words: usize,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self { min_words: 3 }
    }
}

impl QuestionExtractor for HeuristicExtractor {
    fn extract(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        segment_sentences(text)
            .into_iter()
            .filter_map(|sentence| as_question(&sentence))
            .filter(|q| q.split_whitespace().count() >= self.min_words)
            .filter(|q| seen.insert(normalize(q)))
            .collect()
    }
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Splits on sentence terminators and line breaks, keeping the terminators.
fn segment_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if is_terminator(c) {
            while let Some(&next) = chars.peek() {
                if is_terminator(next) || next == '"' || next == '\'' || next == ')' {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            push_sentence(&mut sentences, &mut current);
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let sentence = current
        .trim()
        .trim_start_matches(|c: char| matches!(c, '-' | '*' | '•' | '"' | '\''))
        .trim();
    if !sentence.is_empty() {
        sentences.push(sentence.to_string());
    }
    current.clear();
}

fn first_word(text: &str) -> String {
    text.split_whitespace()
        .next()
        .map(normalize)
        .unwrap_or_default()
}

fn ends_as_question(sentence: &str) -> bool {
    sentence
        .chars()
        .rev()
        .take_while(|c| is_terminator(*c) || matches!(c, '"' | '\'' | ')'))
        .any(|c| c == '?')
}

fn as_question(sentence: &str) -> Option<String> {
    let normalized = normalize(sentence);
    let starts_interrogative = INTERROGATIVES.contains(&first_word(sentence).as_str());
    let starts_prompt = PROMPT_OPENINGS.iter().any(|p| normalized.starts_with(p));

    if ends_as_question(sentence) {
        if starts_interrogative || starts_prompt {
            return Some(sentence.to_string());
        }
        return Some(trim_leading_clause(sentence));
    }
    // Without a question mark only an explicit prompt counts.
    starts_prompt.then(|| sentence.to_string())
}

/// Drops an acknowledgement clause in front of the actual question, as in
/// "That sounds lovely, what happened next?".
fn trim_leading_clause(sentence: &str) -> String {
    let mut best = None;
    for (idx, c) in sentence.char_indices() {
        if matches!(c, ',' | ';' | ':' | '—') {
            let rest = sentence[idx + c.len_utf8()..].trim_start();
            let word = first_word(rest);
            let is_prompt = PROMPT_OPENINGS.iter().any(|p| normalize(rest).starts_with(p));
            if INTERROGATIVES.contains(&word.as_str()) || is_prompt {
                best = Some(rest);
            }
        }
    }
    match best {
        Some(rest) => capitalize(rest),
        None => sentence.to_string(),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
