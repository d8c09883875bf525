//! Conversation context building and caching.

use crate::model::{BookProfile, ConversationContext, MAX_RECENT_CHAPTERS, UserProfile};
use crate::store::ContextSource;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: Option<String>,
}

impl ContextKey {
    pub fn new(user_id: &str, book_id: &str, chapter_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            chapter_id: chapter_id.map(str::to_string),
        }
    }
}

#[async_trait]
pub trait ContextBuilder: Send + Sync {
    async fn build(&self, key: &ContextKey) -> Result<ConversationContext>;
}

/// Builds contexts from a [`ContextSource`], substituting placeholder
/// profiles when the user or book has none yet.
pub struct SourceContextBuilder {
    source: Arc<dyn ContextSource>,
}

impl SourceContextBuilder {
    pub fn new(source: Arc<dyn ContextSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ContextBuilder for SourceContextBuilder {
    async fn build(&self, key: &ContextKey) -> Result<ConversationContext> {
        let user_profile = self
            .source
            .user_profile(&key.user_id)
            .await
            .context("failed to load user profile")?
            .unwrap_or_else(|| UserProfile::placeholder(&key.user_id));
        let book_profile = self
            .source
            .book_profile(&key.user_id, &key.book_id)
            .await
            .context("failed to load book profile")?
            .unwrap_or_else(|| BookProfile::placeholder(&key.book_id));
        let current_chapter = match &key.chapter_id {
            Some(chapter_id) => self
                .source
                .chapter(&key.user_id, &key.book_id, chapter_id)
                .await
                .context("failed to load current chapter")?,
            None => None,
        };
        let mut recent_chapters = self
            .source
            .recent_chapters(&key.user_id, &key.book_id, MAX_RECENT_CHAPTERS + 1)
            .await
            .context("failed to load recent chapters")?;
        recent_chapters.retain(|c| Some(&c.chapter_id) != key.chapter_id.as_ref());
        recent_chapters.truncate(MAX_RECENT_CHAPTERS);
        let life_themes = self
            .source
            .life_themes(&key.user_id, &key.book_id)
            .await
            .context("failed to load life themes")?;

        Ok(ConversationContext {
            user_profile,
            book_profile,
            current_chapter,
            recent_chapters,
            life_themes,
        })
    }
}

struct CachedContext {
    context: Arc<ConversationContext>,
    expires_at: Instant,
}

/// TTL cache of built contexts, shared by every session of a
/// `(user, book, chapter)` triple.
///
/// Expiry is checked on every read. Concurrent misses may both rebuild; the
/// last one to finish wins.
pub struct ContextCache {
    builder: Arc<dyn ContextBuilder>,
    ttl: Duration,
    entries: RwLock<HashMap<ContextKey, CachedContext>>,
}

impl ContextCache {
    pub fn new(builder: Arc<dyn ContextBuilder>, ttl: Duration) -> Self {
        Self {
            builder,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_context(
        &self,
        user_id: &str,
        book_id: &str,
        chapter_id: Option<&str>,
    ) -> Result<Arc<ConversationContext>> {
        let key = ContextKey::new(user_id, book_id, chapter_id);
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                if Instant::now() < entry.expires_at {
                    debug!(user_id, book_id, "context cache hit");
                    return Ok(entry.context.clone());
                }
            }
        }
        self.rebuild(key).await
    }

    /// Rebuilds the entry regardless of its expiry.
    pub async fn refresh(&self, key: &ContextKey) -> Result<Arc<ConversationContext>> {
        self.rebuild(key.clone()).await
    }

    pub async fn invalidate(&self, key: &ContextKey) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Drops every expired entry, returning how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Runs [`ContextCache::sweep_expired`] every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep_expired().await;
                if removed > 0 {
                    debug!(removed, "swept expired contexts");
                }
            }
        })
    }

    async fn rebuild(&self, key: ContextKey) -> Result<Arc<ConversationContext>> {
        info!(
            user_id = %key.user_id,
            book_id = %key.book_id,
            chapter_id = ?key.chapter_id,
            "building conversation context"
        );
        let context = Arc::new(self.builder.build(&key).await?);
        self.entries.write().await.insert(
            key,
            CachedContext {
                context: context.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(context)
    }
}
