//! Engagement signals derived from a session's messages.
//!
//! Everything here is a pure read over a message slice. Results steer the
//! interviewer's style and are surfaced to the user as hints, never as
//! hard decisions.

mod lexicon;

pub use lexicon::{
    EmotionalTone, KeywordTopicDetector, LexiconToneClassifier, ToneClassifier, TopicDetector,
};

use crate::model::{ConversationMessage, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Average user reply length, in words, above which a conversation counts as deep.
pub const LONG_REPLY_WORDS: f64 = 20.0;
/// Each of the last three replies must exceed this many words to count as sustained.
pub const SUSTAINED_REPLY_WORDS: usize = 10;
/// A shrinking run of replies ending below this signals fading interest.
pub const LOSING_INTEREST_WORDS: usize = 10;
/// A growing run of replies ending above this signals deep engagement.
pub const ENGAGED_WORDS: usize = 50;
/// Minimum number of messages before a pattern is reported.
pub const PATTERN_MIN_MESSAGES: usize = 4;
/// Health at or above this is considered healthy.
pub const HEALTHY_SCORE: u8 = 3;
const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPattern {
    LosingInterest,
    Engaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStyle {
    Concise,
    DeepDive,
    #[default]
    Supportive,
}

impl ConversationStyle {
    /// Instruction appended to the interviewer prompt for this style.
    pub fn guidance(&self) -> &'static str {
        match self {
            ConversationStyle::Concise => {
                "Keep your reply short and ask one simple, easy-to-answer question."
            }
            ConversationStyle::DeepDive => {
                "The author is engaged. Ask a thoughtful follow-up that goes deeper into details and meaning."
            }
            ConversationStyle::Supportive => {
                "Be warm and encouraging, acknowledge what was shared, then ask one open question."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Encouragement,
    Supportive,
    TopicExploration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationInsights {
    pub message_count: usize,
    pub user_message_count: usize,
    pub average_response_length: f64,
    pub emotional_tone: EmotionalTone,
    pub topics_discussed: Vec<String>,
    pub health: u8,
    pub pattern: Option<ConversationPattern>,
    pub optimal_style: ConversationStyle,
}

#[derive(Clone)]
pub struct ConversationAnalyzer {
    tone: Arc<dyn ToneClassifier>,
    topics: Arc<dyn TopicDetector>,
}

impl Default for ConversationAnalyzer {
    fn default() -> Self {
        Self::new(
            Arc::new(LexiconToneClassifier::default()),
            Arc::new(KeywordTopicDetector::default()),
        )
    }
}

fn user_messages(messages: &[ConversationMessage]) -> impl Iterator<Item = &ConversationMessage> {
    messages.iter().filter(|m| m.role == Role::User)
}

fn user_text(messages: &[ConversationMessage]) -> String {
    user_messages(messages)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Word counts of the last three user messages, oldest first.
fn last_three_user_counts(messages: &[ConversationMessage]) -> Option<[usize; 3]> {
    let counts: Vec<usize> = user_messages(messages).map(|m| m.word_count()).collect();
    match counts.as_slice() {
        [.., a, b, c] => Some([*a, *b, *c]),
        _ => None,
    }
}

impl ConversationAnalyzer {
    pub fn new(tone: Arc<dyn ToneClassifier>, topics: Arc<dyn TopicDetector>) -> Self {
        Self { tone, topics }
    }

    /// Mean word count of user messages, `0.0` when there are none.
    pub fn average_response_length(&self, messages: &[ConversationMessage]) -> f64 {
        let counts: Vec<usize> = user_messages(messages).map(|m| m.word_count()).collect();
        if counts.is_empty() {
            return 0.0;
        }
        counts.iter().sum::<usize>() as f64 / counts.len() as f64
    }

    pub fn emotional_tone(&self, messages: &[ConversationMessage]) -> EmotionalTone {
        self.tone.classify(&user_text(messages))
    }

    /// Topic labels found in user text, in detector order.
    pub fn topics_discussed(&self, messages: &[ConversationMessage]) -> Vec<String> {
        let found = self.topics.detect(&user_text(messages));
        self.topics
            .labels()
            .into_iter()
            .filter(|label| found.contains(label))
            .collect()
    }

    /// Engagement score from 1 to 5.
    pub fn conversation_health(&self, messages: &[ConversationMessage]) -> u8 {
        let mut score = 1u8;
        if self.average_response_length(messages) > LONG_REPLY_WORDS {
            score += 1;
        }
        if user_messages(messages).any(|m| m.content.contains('?')) {
            score += 1;
        }
        if user_messages(messages).any(|m| self.tone.has_emotion(&m.content)) {
            score += 1;
        }
        if last_three_user_counts(messages)
            .is_some_and(|counts| counts.iter().all(|&c| c > SUSTAINED_REPLY_WORDS))
        {
            score += 1;
        }
        score.min(5)
    }

    pub fn is_healthy_conversation(&self, messages: &[ConversationMessage]) -> bool {
        self.conversation_health(messages) >= HEALTHY_SCORE
    }

    pub fn conversation_pattern(
        &self,
        messages: &[ConversationMessage],
    ) -> Option<ConversationPattern> {
        if messages.len() < PATTERN_MIN_MESSAGES {
            return None;
        }
        let [a, b, c] = last_three_user_counts(messages)?;
        if a > b && b > c && c < LOSING_INTEREST_WORDS {
            Some(ConversationPattern::LosingInterest)
        } else if a < b && b < c && c > ENGAGED_WORDS {
            Some(ConversationPattern::Engaged)
        } else {
            None
        }
    }

    pub fn optimal_style(&self, messages: &[ConversationMessage]) -> ConversationStyle {
        match self.conversation_pattern(messages) {
            Some(ConversationPattern::LosingInterest) => ConversationStyle::Concise,
            Some(ConversationPattern::Engaged) => ConversationStyle::DeepDive,
            None => ConversationStyle::Supportive,
        }
    }

    /// Up to three hints, most important first.
    pub fn continuation_suggestions(&self, messages: &[ConversationMessage]) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();
        if self.conversation_health(messages) < HEALTHY_SCORE {
            suggestions.push(Suggestion {
                kind: SuggestionKind::Encouragement,
                message: "Try sharing a specific moment, with who was there and how it felt."
                    .to_string(),
            });
        }
        if self.emotional_tone(messages) == EmotionalTone::Negative {
            suggestions.push(Suggestion {
                kind: SuggestionKind::Supportive,
                message: "These memories sound difficult. Take your time, or move to a lighter topic."
                    .to_string(),
            });
        }
        let discussed = self.topics_discussed(messages);
        if let Some(topic) = self
            .topics
            .labels()
            .into_iter()
            .find(|label| !discussed.contains(label))
        {
            suggestions.push(Suggestion {
                kind: SuggestionKind::TopicExploration,
                message: format!("You haven't talked about {topic} yet. It could be worth exploring."),
            });
        }
        suggestions.truncate(MAX_SUGGESTIONS);
        suggestions
    }

    pub fn insights(&self, messages: &[ConversationMessage]) -> ConversationInsights {
        ConversationInsights {
            message_count: messages.len(),
            user_message_count: user_messages(messages).count(),
            average_response_length: self.average_response_length(messages),
            emotional_tone: self.emotional_tone(messages),
            topics_discussed: self.topics_discussed(messages),
            health: self.conversation_health(messages),
            pattern: self.conversation_pattern(messages),
            optimal_style: self.optimal_style(messages),
        }
    }
}
