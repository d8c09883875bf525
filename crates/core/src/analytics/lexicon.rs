use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionalTone {
    Positive,
    Neutral,
    Negative,
}

pub trait ToneClassifier: Send + Sync {
    fn classify(&self, text: &str) -> EmotionalTone;

    /// Whether the text carries any emotional vocabulary at all.
    fn has_emotion(&self, text: &str) -> bool;
}

/// Ordered topic labels with a keyword test per label.
pub trait TopicDetector: Send + Sync {
    fn labels(&self) -> Vec<String>;

    fn detect(&self, text: &str) -> BTreeSet<String>;
}

pub(crate) fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn word_set(words: &[&str]) -> HashSet<String> {
    words.iter().map(|w| w.to_string()).collect()
}

const POSITIVE: &[&str] = &[
    "happy", "happiest", "happiness", "joy", "joyful", "love", "loved", "loving", "wonderful",
    "proud", "grateful", "thankful", "excited", "exciting", "fun", "beautiful", "glad", "laugh",
    "laughed", "laughing", "delighted", "cherish", "cherished", "fond", "hope", "hopeful",
    "amazing", "best", "favourite", "favorite", "peaceful",
];

const NEGATIVE: &[&str] = &[
    "sad", "sadness", "angry", "anger", "scared", "afraid", "fear", "lonely", "alone", "hurt",
    "cried", "crying", "grief", "grieving", "miss", "missed", "worried", "worry", "painful",
    "pain", "upset", "regret", "ashamed", "terrible", "awful", "hated", "hate", "difficult",
    "struggled", "struggle", "nervous", "anxious",
];

const NEUTRAL_EMOTION: &[&str] = &["felt", "feel", "feeling", "feelings", "emotional", "emotions"];

/// Counts positive and negative word hits; ties are neutral.
#[derive(Debug, Clone)]
pub struct LexiconToneClassifier {
    positive: HashSet<String>,
    negative: HashSet<String>,
    neutral: HashSet<String>,
}

impl Default for LexiconToneClassifier {
    fn default() -> Self {
        Self {
            positive: word_set(POSITIVE),
            negative: word_set(NEGATIVE),
            neutral: word_set(NEUTRAL_EMOTION),
        }
    }
}

impl ToneClassifier for LexiconToneClassifier {
    fn classify(&self, text: &str) -> EmotionalTone {
        let (mut positive, mut negative) = (0usize, 0usize);
        for token in tokens(text) {
            if self.positive.contains(&token) {
                positive += 1;
            } else if self.negative.contains(&token) {
                negative += 1;
            }
        }
        match positive.cmp(&negative) {
            std::cmp::Ordering::Greater => EmotionalTone::Positive,
            std::cmp::Ordering::Less => EmotionalTone::Negative,
            std::cmp::Ordering::Equal => EmotionalTone::Neutral,
        }
    }

    fn has_emotion(&self, text: &str) -> bool {
        tokens(text).any(|t| {
            self.positive.contains(&t) || self.negative.contains(&t) || self.neutral.contains(&t)
        })
    }
}

const TOPICS: &[(&str, &[&str])] = &[
    (
        "family",
        &[
            "family", "mother", "father", "mum", "mom", "dad", "parents", "sister", "brother",
            "siblings", "grandmother", "grandfather", "grandma", "grandpa", "aunt", "uncle",
            "cousin", "son", "daughter", "children", "kids",
        ],
    ),
    (
        "childhood",
        &["childhood", "child", "kid", "young", "little", "toys", "playground", "grew"],
    ),
    (
        "education",
        &["school", "teacher", "class", "university", "college", "studied", "exam", "lessons"],
    ),
    (
        "career",
        &["job", "work", "worked", "career", "boss", "office", "business", "retired", "colleagues"],
    ),
    (
        "relationships",
        &["married", "wedding", "husband", "wife", "partner", "boyfriend", "girlfriend", "dating"],
    ),
    (
        "friendship",
        &["friend", "friends", "friendship", "mate", "mates", "neighbour", "neighbor"],
    ),
    (
        "places",
        &["home", "house", "town", "city", "village", "street", "moved", "neighbourhood", "farm"],
    ),
    (
        "travel",
        &["travel", "travelled", "traveled", "trip", "abroad", "holiday", "vacation", "journey"],
    ),
    (
        "health",
        &["health", "hospital", "illness", "sick", "doctor", "surgery", "recovery"],
    ),
    (
        "beliefs",
        &["faith", "church", "religion", "belief", "beliefs", "values", "god", "spiritual"],
    ),
];

/// Matches user text against a fixed table of life-story topics.
#[derive(Debug, Clone)]
pub struct KeywordTopicDetector {
    topics: Vec<(String, HashSet<String>)>,
}

impl Default for KeywordTopicDetector {
    fn default() -> Self {
        Self {
            topics: TOPICS
                .iter()
                .map(|(label, words)| (label.to_string(), word_set(words)))
                .collect(),
        }
    }
}

impl TopicDetector for KeywordTopicDetector {
    fn labels(&self) -> Vec<String> {
        self.topics.iter().map(|(label, _)| label.clone()).collect()
    }

    fn detect(&self, text: &str) -> BTreeSet<String> {
        let words: HashSet<String> = tokens(text).collect();
        self.topics
            .iter()
            .filter(|(_, keywords)| !keywords.is_disjoint(&words))
            .map(|(label, _)| label.clone())
            .collect()
    }
}
