//! Persistence contracts consumed by the engine.
//!
//! The engine never talks to a database directly. Every read and write goes
//! through one of these traits, scoped by `(session_id, user_id)` for
//! conversations and by `(scope, type, hash)` for tracked questions.

mod memory;

pub use memory::InMemoryStore;

use crate::ledger::TrackedQuestion;
use crate::model::{
    BookProfile, ChapterSummary, ConversationMessage, ConversationRecord, ConversationType,
    ScopeKey, UserProfile,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Inserts or fully overwrites the record keyed by `(session_id, user_id)`.
    async fn save(&self, record: &ConversationRecord) -> Result<()>;

    async fn find(&self, session_id: &str, user_id: &str) -> Result<Option<ConversationRecord>>;

    /// Overwrites the message list of an existing record.
    ///
    /// Fails when no record exists for `(session_id, user_id)`.
    async fn replace_messages(
        &self,
        session_id: &str,
        user_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<()>;

    /// Returns `true` when a record was removed.
    async fn delete(&self, session_id: &str, user_id: &str) -> Result<bool>;

    /// The user's most recently updated records, newest first.
    async fn list_recent(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationRecord>>;
}

/// Outcome of inserting a tracked question against the unique
/// `(scope, type, hash)` constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateHash,
}

#[async_trait]
pub trait QuestionStore: Send + Sync {
    async fn insert(&self, question: &TrackedQuestion) -> Result<InsertOutcome>;

    /// Questions in scope, oldest first. `None` for the type means all types.
    async fn list(
        &self,
        scope: &ScopeKey,
        conversation_type: Option<ConversationType>,
    ) -> Result<Vec<TrackedQuestion>>;

    /// Returns `false` when the user has no question with this id.
    async fn set_rating(&self, user_id: &str, question_id: &str, rating: u8) -> Result<bool>;
}

/// Per-session slot for unsent input.
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn get_draft(&self, user_id: &str, session_id: &str) -> Result<Option<String>>;
    async fn set_draft(&self, user_id: &str, session_id: &str, text: &str) -> Result<()>;
    async fn clear_draft(&self, user_id: &str, session_id: &str) -> Result<()>;
}

/// Read-only view of the profile and chapter data the context is built from.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    async fn book_profile(&self, user_id: &str, book_id: &str) -> Result<Option<BookProfile>>;
    async fn chapter(
        &self,
        user_id: &str,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterSummary>>;
    /// Most recently updated chapters of the book, newest first.
    async fn recent_chapters(
        &self,
        user_id: &str,
        book_id: &str,
        limit: usize,
    ) -> Result<Vec<ChapterSummary>>;
    async fn life_themes(&self, user_id: &str, book_id: &str) -> Result<BTreeSet<String>>;
}
