//! Conversation data model shared by the text controller and the voice relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Upper bound on `ConversationContext::recent_chapters`.
pub const MAX_RECENT_CHAPTERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Interview,
    Reflection,
    Brainstorming,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Interview => "interview",
            ConversationType::Reflection => "reflection",
            ConversationType::Brainstorming => "brainstorming",
        }
    }

    /// The fixed goals attached to every session of this type.
    pub fn goals(&self) -> Vec<String> {
        let goals: &[&str] = match self {
            ConversationType::Interview => &[
                "Draw out specific memories and stories",
                "Capture sensory details, people and places",
                "Build material for the current chapter",
            ],
            ConversationType::Reflection => &[
                "Explore what past experiences meant",
                "Connect events to lasting values and lessons",
                "Surface emotions the writer wants to convey",
            ],
            ConversationType::Brainstorming => &[
                "Generate chapter ideas and angles",
                "Find themes that tie the book together",
                "Decide what to write about next",
            ],
        };
        goals.iter().map(|g| g.to_string()).collect()
    }
}

impl fmt::Display for ConversationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "interview" => Ok(ConversationType::Interview),
            "reflection" => Ok(ConversationType::Reflection),
            "brainstorming" => Ok(ConversationType::Brainstorming),
            other => Err(format!("unknown conversation type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMedium {
    Text,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    /// Parses one persisted message entry, rejecting partial or empty ones.
    fn from_value(value: &serde_json::Value, fallback: DateTime<Utc>) -> Option<Self> {
        let role: Role = serde_json::from_value(value.get("role")?.clone()).ok()?;
        let content = value.get("content")?.as_str()?.trim();
        if content.is_empty() {
            return None;
        }
        let timestamp = value
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(fallback);
        Some(Self {
            role,
            content: content.to_string(),
            timestamp,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub birth_year: Option<i32>,
    pub hometown: Option<String>,
    pub bio: Option<String>,
}

impl UserProfile {
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookProfile {
    pub book_id: String,
    pub title: String,
    pub description: Option<String>,
    pub tone: Option<String>,
    pub target_audience: Option<String>,
}

impl BookProfile {
    pub fn placeholder(book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            title: "Untitled memoir".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter_id: String,
    pub title: String,
    pub summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Everything injected into an AI turn to personalise it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_profile: UserProfile,
    pub book_profile: BookProfile,
    pub current_chapter: Option<ChapterSummary>,
    pub recent_chapters: Vec<ChapterSummary>,
    pub life_themes: BTreeSet<String>,
}

impl ConversationContext {
    /// Renders the context as prompt text.
    pub fn describe(&self) -> String {
        let mut lines = Vec::new();
        let name = self
            .user_profile
            .display_name
            .as_deref()
            .unwrap_or("the author");
        lines.push(format!("Author: {name}"));
        if let Some(year) = self.user_profile.birth_year {
            lines.push(format!("Born: {year}"));
        }
        if let Some(hometown) = &self.user_profile.hometown {
            lines.push(format!("Hometown: {hometown}"));
        }
        if let Some(bio) = &self.user_profile.bio {
            lines.push(format!("About: {bio}"));
        }
        lines.push(format!("Book: {}", self.book_profile.title));
        if let Some(description) = &self.book_profile.description {
            lines.push(format!("Book description: {description}"));
        }
        if let Some(tone) = &self.book_profile.tone {
            lines.push(format!("Desired tone: {tone}"));
        }
        if let Some(chapter) = &self.current_chapter {
            lines.push(format!("Current chapter: {}", chapter.title));
            if let Some(summary) = &chapter.summary {
                lines.push(format!("Chapter so far: {summary}"));
            }
        }
        if !self.recent_chapters.is_empty() {
            let titles: Vec<&str> = self
                .recent_chapters
                .iter()
                .map(|c| c.title.as_str())
                .collect();
            lines.push(format!("Recent chapters: {}", titles.join(", ")));
        }
        if !self.life_themes.is_empty() {
            let themes: Vec<&str> = self.life_themes.iter().map(String::as_str).collect();
            lines.push(format!("Life themes: {}", themes.join(", ")));
        }
        lines.join("\n")
    }
}

/// One conversation between a user and the interviewer, text or voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: Option<String>,
    pub conversation_type: ConversationType,
    pub conversation_medium: ConversationMedium,
    pub messages: Vec<ConversationMessage>,
    pub goals: Vec<String>,
    pub context: ConversationContext,
    pub is_self_conversation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        book_id: impl Into<String>,
        chapter_id: Option<String>,
        conversation_type: ConversationType,
        conversation_medium: ConversationMedium,
        context: ConversationContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            book_id: book_id.into(),
            chapter_id,
            conversation_type,
            conversation_medium,
            messages: Vec::new(),
            goals: conversation_type.goals(),
            context,
            is_self_conversation: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends a message, keeping timestamps non-decreasing.
    pub fn append(&mut self, mut message: ConversationMessage) {
        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                message.timestamp = last.timestamp;
            }
        }
        self.updated_at = message.timestamp.max(self.updated_at);
        self.messages.push(message);
    }

    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    pub fn to_record(&self) -> ConversationRecord {
        ConversationRecord {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            book_id: self.book_id.clone(),
            chapter_id: self.chapter_id.clone(),
            conversation_type: self.conversation_type,
            conversation_medium: self.conversation_medium,
            messages: messages_to_values(&self.messages),
            context_snapshot: serde_json::to_value(&self.context).ok(),
            goals: self.goals.clone(),
            is_self_conversation: self.is_self_conversation,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Rebuilds a session from its persisted record.
    ///
    /// Message entries that are malformed or empty are dropped instead of
    /// failing the whole record, and an unreadable context snapshot falls
    /// back to an empty context.
    pub fn from_record(record: &ConversationRecord) -> Self {
        let mut session = Self {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            book_id: record.book_id.clone(),
            chapter_id: record.chapter_id.clone(),
            conversation_type: record.conversation_type,
            conversation_medium: record.conversation_medium,
            messages: Vec::with_capacity(record.messages.len()),
            goals: if record.goals.is_empty() {
                record.conversation_type.goals()
            } else {
                record.goals.clone()
            },
            context: record
                .context_snapshot
                .clone()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
            is_self_conversation: record.is_self_conversation,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        let mut fallback = record.created_at;
        for value in &record.messages {
            if let Some(message) = ConversationMessage::from_value(value, fallback) {
                fallback = message.timestamp;
                session.append(message);
            }
        }
        session.updated_at = record.updated_at;
        session
    }
}

/// The persisted shape of a session, keyed by `(session_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub session_id: String,
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: Option<String>,
    pub conversation_type: ConversationType,
    pub conversation_medium: ConversationMedium,
    pub messages: Vec<serde_json::Value>,
    pub context_snapshot: Option<serde_json::Value>,
    pub goals: Vec<String>,
    pub is_self_conversation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn messages_to_values(messages: &[ConversationMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect()
}

/// The `(user, book)` pair that bounds question deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub user_id: String,
    pub book_id: String,
}

impl ScopeKey {
    pub fn new(user_id: impl Into<String>, book_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            book_id: book_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn session() -> ConversationSession {
        ConversationSession::new(
            "s1",
            "u1",
            "b1",
            None,
            ConversationType::Interview,
            ConversationMedium::Text,
            ConversationContext::default(),
        )
    }

    #[test]
    fn append_clamps_timestamps_to_be_non_decreasing() {
        let mut session = session();
        let first = ConversationMessage::user("first");
        let mut second = ConversationMessage::assistant("second");
        second.timestamp = first.timestamp - Duration::seconds(30);

        session.append(first.clone());
        session.append(second);

        assert_eq!(session.messages[1].timestamp, first.timestamp);
    }

    #[test]
    fn from_record_filters_malformed_messages() {
        let mut record = session().to_record();
        record.messages = vec![
            json!({"role": "assistant", "content": "Where did you grow up?", "timestamp": "2024-05-01T10:00:00Z"}),
            json!({"role": "user"}),
            json!({"role": "narrator", "content": "???"}),
            json!({"role": "user", "content": "   "}),
            json!("garbage"),
            json!({"role": "user", "content": "In Perth."}),
        ];

        let restored = ConversationSession::from_record(&record);

        assert_eq!(restored.messages.len(), 2);
        assert_eq!(restored.messages[0].role, Role::Assistant);
        assert_eq!(restored.messages[1].content, "In Perth.");
        // A message without a timestamp inherits the previous one.
        assert_eq!(restored.messages[1].timestamp, restored.messages[0].timestamp);
    }

    #[test]
    fn record_round_trip_keeps_context_and_goals() {
        let mut original = session();
        original.context.book_profile = BookProfile::placeholder("b1");
        original.context.life_themes.insert("resilience".to_string());
        original.append(ConversationMessage::assistant("Tell me about your first home."));

        let restored = ConversationSession::from_record(&original.to_record());

        assert_eq!(restored.context, original.context);
        assert_eq!(restored.goals, ConversationType::Interview.goals());
        assert_eq!(restored.messages, original.messages);
    }

    #[test]
    fn conversation_type_parses_case_insensitively() {
        assert_eq!(
            "Reflection".parse::<ConversationType>(),
            Ok(ConversationType::Reflection)
        );
        assert!("podcast".parse::<ConversationType>().is_err());
    }
}
