use super::{ContextSource, ConversationStore, DraftStore, InsertOutcome, QuestionStore};
use crate::ledger::TrackedQuestion;
use crate::model::{
    BookProfile, ChapterSummary, ConversationMessage, ConversationRecord, ConversationType,
    ScopeKey, UserProfile, messages_to_values,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

type SessionKey = (String, String);
type BookKey = (String, String);

/// Process-local implementation of every store trait.
///
/// Backs the API service and the tests. Enforces the same scoping and
/// uniqueness rules a database-backed store would.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<SessionKey, ConversationRecord>>,
    questions: RwLock<Vec<TrackedQuestion>>,
    drafts: RwLock<HashMap<SessionKey, String>>,
    users: RwLock<HashMap<String, UserProfile>>,
    books: RwLock<HashMap<BookKey, BookProfile>>,
    chapters: RwLock<HashMap<BookKey, Vec<ChapterSummary>>>,
    themes: RwLock<HashMap<BookKey, BTreeSet<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_user_profile(&self, profile: UserProfile) {
        self.users
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    pub async fn put_book_profile(&self, user_id: &str, profile: BookProfile) {
        self.books
            .write()
            .await
            .insert((user_id.to_string(), profile.book_id.clone()), profile);
    }

    /// Inserts or replaces a chapter of the book.
    pub async fn put_chapter(&self, user_id: &str, book_id: &str, chapter: ChapterSummary) {
        let mut chapters = self.chapters.write().await;
        let entry = chapters
            .entry((user_id.to_string(), book_id.to_string()))
            .or_default();
        entry.retain(|c| c.chapter_id != chapter.chapter_id);
        entry.push(chapter);
    }

    pub async fn put_life_themes(&self, user_id: &str, book_id: &str, themes: BTreeSet<String>) {
        self.themes
            .write()
            .await
            .insert((user_id.to_string(), book_id.to_string()), themes);
    }

    pub async fn question_count(&self) -> usize {
        self.questions.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        self.conversations.write().await.insert(
            (record.session_id.clone(), record.user_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn find(&self, session_id: &str, user_id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self
            .conversations
            .read()
            .await
            .get(&(session_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn replace_messages(
        &self,
        session_id: &str,
        user_id: &str,
        messages: &[ConversationMessage],
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let record = conversations
            .get_mut(&(session_id.to_string(), user_id.to_string()))
            .ok_or_else(|| anyhow!("conversation {session_id} not found for user"))?;
        record.messages = messages_to_values(messages);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, session_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .conversations
            .write()
            .await
            .remove(&(session_id.to_string(), user_id.to_string()))
            .is_some())
    }

    async fn list_recent(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationRecord>> {
        let conversations = self.conversations.read().await;
        let mut records: Vec<ConversationRecord> = conversations
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl QuestionStore for InMemoryStore {
    async fn insert(&self, question: &TrackedQuestion) -> Result<InsertOutcome> {
        let mut questions = self.questions.write().await;
        let exists = questions.iter().any(|q| {
            q.scope == question.scope
                && q.conversation_type == question.conversation_type
                && q.question_hash == question.question_hash
        });
        if exists {
            return Ok(InsertOutcome::DuplicateHash);
        }
        questions.push(question.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list(
        &self,
        scope: &ScopeKey,
        conversation_type: Option<ConversationType>,
    ) -> Result<Vec<TrackedQuestion>> {
        Ok(self
            .questions
            .read()
            .await
            .iter()
            .filter(|q| &q.scope == scope)
            .filter(|q| conversation_type.is_none_or(|t| q.conversation_type == t))
            .cloned()
            .collect())
    }

    async fn set_rating(&self, user_id: &str, question_id: &str, rating: u8) -> Result<bool> {
        let mut questions = self.questions.write().await;
        match questions
            .iter_mut()
            .find(|q| q.id == question_id && q.scope.user_id == user_id)
        {
            Some(question) => {
                question.response_quality = Some(rating);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DraftStore for InMemoryStore {
    async fn get_draft(&self, user_id: &str, session_id: &str) -> Result<Option<String>> {
        Ok(self
            .drafts
            .read()
            .await
            .get(&(session_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn set_draft(&self, user_id: &str, session_id: &str, text: &str) -> Result<()> {
        self.drafts.write().await.insert(
            (session_id.to_string(), user_id.to_string()),
            text.to_string(),
        );
        Ok(())
    }

    async fn clear_draft(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.drafts
            .write()
            .await
            .remove(&(session_id.to_string(), user_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ContextSource for InMemoryStore {
    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn book_profile(&self, user_id: &str, book_id: &str) -> Result<Option<BookProfile>> {
        Ok(self
            .books
            .read()
            .await
            .get(&(user_id.to_string(), book_id.to_string()))
            .cloned())
    }

    async fn chapter(
        &self,
        user_id: &str,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<Option<ChapterSummary>> {
        Ok(self
            .chapters
            .read()
            .await
            .get(&(user_id.to_string(), book_id.to_string()))
            .and_then(|chapters| chapters.iter().find(|c| c.chapter_id == chapter_id))
            .cloned())
    }

    async fn recent_chapters(
        &self,
        user_id: &str,
        book_id: &str,
        limit: usize,
    ) -> Result<Vec<ChapterSummary>> {
        let mut chapters = self
            .chapters
            .read()
            .await
            .get(&(user_id.to_string(), book_id.to_string()))
            .cloned()
            .unwrap_or_default();
        chapters.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        chapters.truncate(limit);
        Ok(chapters)
    }

    async fn life_themes(&self, user_id: &str, book_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .themes
            .read()
            .await
            .get(&(user_id.to_string(), book_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
