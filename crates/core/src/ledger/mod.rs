//! Tracking of the questions the interviewer has already asked.
//!
//! Every assistant utterance, text or voice, goes through
//! [`QuestionLedger::track_response`]: questions are extracted, fingerprinted
//! and recorded unless an equivalent question already exists for the same
//! `(user, book, conversation type)`.

mod extract;
mod fingerprint;

pub use extract::{HeuristicExtractor, QuestionExtractor};
pub use fingerprint::{DEFAULT_SIMILARITY_THRESHOLD, Fingerprint, MAX_KEYWORDS, similarity};

use crate::error::{MemoirError, Result};
use crate::model::{ConversationType, ScopeKey};
use crate::store::{InsertOutcome, QuestionStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedQuestion {
    pub id: String,
    pub question_text: String,
    pub question_hash: String,
    pub semantic_keywords: Vec<String>,
    pub conversation_type: ConversationType,
    pub scope: ScopeKey,
    pub chapter_id: Option<String>,
    pub session_id: Option<String>,
    pub response_quality: Option<u8>,
    pub asked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Recorded(TrackedQuestion),
    Duplicate,
}

/// Where a question was asked.
#[derive(Debug, Clone, Default)]
pub struct QuestionOrigin {
    pub chapter_id: Option<String>,
    pub session_id: Option<String>,
}

impl QuestionOrigin {
    pub fn new(chapter_id: Option<&str>, session_id: Option<&str>) -> Self {
        Self {
            chapter_id: chapter_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionStats {
    pub total_questions: usize,
    pub unique_questions: usize,
    pub counts_by_type: BTreeMap<ConversationType, usize>,
    /// Mean of the rated questions, `None` when nothing is rated.
    pub average_quality: Option<f64>,
}

type LockKey = (ScopeKey, ConversationType);

pub struct QuestionLedger {
    store: Arc<dyn QuestionStore>,
    extractor: Arc<dyn QuestionExtractor>,
    threshold: f64,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuestionLedger {
    pub fn new(store: Arc<dyn QuestionStore>, extractor: Arc<dyn QuestionExtractor>) -> Self {
        Self {
            store,
            extractor,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn extract_questions(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        self.extractor.extract(text)
    }

    pub async fn is_duplicate(
        &self,
        scope: &ScopeKey,
        conversation_type: ConversationType,
        text: &str,
    ) -> Result<bool> {
        let fingerprint = fingerprint_of(text)?;
        self.matches_existing(scope, conversation_type, &fingerprint)
            .await
    }

    /// Records the question unless an equivalent one already exists in scope.
    pub async fn record_question(
        &self,
        scope: &ScopeKey,
        conversation_type: ConversationType,
        text: &str,
        origin: &QuestionOrigin,
    ) -> Result<RecordOutcome> {
        let fingerprint = fingerprint_of(text)?;
        let key = (scope.clone(), conversation_type);
        let lock = self.lock_for(&key);
        let outcome = {
            let _guard = lock.lock().await;
            self.record_locked(scope, conversation_type, text, fingerprint, origin)
                .await
        };
        self.release_lock(&key, lock);
        outcome
    }

    /// Check-then-insert. Callers hold the `(scope, type)` lock.
    async fn record_locked(
        &self,
        scope: &ScopeKey,
        conversation_type: ConversationType,
        text: &str,
        fingerprint: Fingerprint,
        origin: &QuestionOrigin,
    ) -> Result<RecordOutcome> {
        if self
            .matches_existing(scope, conversation_type, &fingerprint)
            .await?
        {
            debug!(hash = %fingerprint.hash, "question already asked in scope");
            return Ok(RecordOutcome::Duplicate);
        }

        let question = TrackedQuestion {
            id: Uuid::new_v4().to_string(),
            question_text: text.trim().to_string(),
            question_hash: fingerprint.hash,
            semantic_keywords: fingerprint.keywords,
            conversation_type,
            scope: scope.clone(),
            chapter_id: origin.chapter_id.clone(),
            session_id: origin.session_id.clone(),
            response_quality: None,
            asked_at: Utc::now(),
        };
        match self.store.insert(&question).await.map_err(persistence)? {
            InsertOutcome::Inserted => Ok(RecordOutcome::Recorded(question)),
            InsertOutcome::DuplicateHash => Ok(RecordOutcome::Duplicate),
        }
    }

    /// Extracts the questions of an assistant utterance and records the new ones.
    pub async fn track_response(
        &self,
        scope: &ScopeKey,
        conversation_type: ConversationType,
        assistant_text: &str,
        origin: &QuestionOrigin,
    ) -> Result<Vec<TrackedQuestion>> {
        let mut recorded = Vec::new();
        let extracted = self.extract_questions(assistant_text);
        for question in &extracted {
            if let RecordOutcome::Recorded(q) = self
                .record_question(scope, conversation_type, question, origin)
                .await?
            {
                recorded.push(q);
            }
        }
        if !extracted.is_empty() {
            info!(
                user_id = %scope.user_id,
                book_id = %scope.book_id,
                extracted = extracted.len(),
                recorded = recorded.len(),
                "tracked assistant questions"
            );
        }
        Ok(recorded)
    }

    /// The latest `limit` questions in scope, newest first.
    pub async fn recent_questions(
        &self,
        scope: &ScopeKey,
        conversation_type: ConversationType,
        limit: usize,
    ) -> Result<Vec<TrackedQuestion>> {
        let mut questions = self
            .store
            .list(scope, Some(conversation_type))
            .await
            .map_err(persistence)?;
        questions.sort_by(|a, b| b.asked_at.cmp(&a.asked_at));
        questions.truncate(limit);
        Ok(questions)
    }

    /// Rates one of the user's questions.
    ///
    /// Returns `false` when the user has no question with this id.
    pub async fn rate(&self, user_id: &str, question_id: &str, rating: i64) -> Result<bool> {
        let rating = u8::try_from(rating)
            .ok()
            .filter(|r| (1..=5).contains(r))
            .ok_or_else(|| {
                MemoirError::Validation(format!("rating must be between 1 and 5, got {rating}"))
            })?;
        self.store
            .set_rating(user_id, question_id, rating)
            .await
            .map_err(persistence)
    }

    pub async fn stats(&self, user_id: &str, book_id: &str) -> Result<QuestionStats> {
        let questions = self
            .store
            .list(&ScopeKey::new(user_id, book_id), None)
            .await
            .map_err(persistence)?;

        let mut counts_by_type = BTreeMap::new();
        for question in &questions {
            *counts_by_type.entry(question.conversation_type).or_insert(0) += 1;
        }
        let unique_questions = questions
            .iter()
            .map(|q| q.question_hash.as_str())
            .collect::<HashSet<_>>()
            .len();
        let ratings: Vec<f64> = questions
            .iter()
            .filter_map(|q| q.response_quality)
            .map(f64::from)
            .collect();
        let average_quality =
            (!ratings.is_empty()).then(|| ratings.iter().sum::<f64>() / ratings.len() as f64);

        Ok(QuestionStats {
            total_questions: questions.len(),
            unique_questions,
            counts_by_type,
            average_quality,
        })
    }

    async fn matches_existing(
        &self,
        scope: &ScopeKey,
        conversation_type: ConversationType,
        fingerprint: &Fingerprint,
    ) -> Result<bool> {
        let existing = self
            .store
            .list(scope, Some(conversation_type))
            .await
            .map_err(persistence)?;
        Ok(existing.iter().any(|q| {
            q.question_hash == fingerprint.hash
                || similarity(&q.semantic_keywords, &fingerprint.keywords) >= self.threshold
        }))
    }

    fn lock_for(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drops the map entry once nobody else holds or waits on the lock.
    fn release_lock(&self, key: &LockKey, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }
}

fn fingerprint_of(text: &str) -> Result<Fingerprint> {
    let fingerprint = Fingerprint::of(text);
    if fingerprint.is_empty() {
        return Err(MemoirError::Validation(
            "question text must not be empty".to_string(),
        ));
    }
    Ok(fingerprint)
}

fn persistence(err: anyhow::Error) -> MemoirError {
    MemoirError::Persistence(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn ledger() -> (Arc<InMemoryStore>, QuestionLedger) {
        let store = Arc::new(InMemoryStore::new());
        let ledger = QuestionLedger::new(store.clone(), Arc::new(HeuristicExtractor::default()));
        (store, ledger)
    }

    fn scope(book: &str) -> ScopeKey {
        ScopeKey::new("alice", book)
    }

    const INTERVIEW: ConversationType = ConversationType::Interview;

    #[tokio::test]
    async fn recording_the_same_question_twice_keeps_one_row() {
        let (store, ledger) = ledger();
        let origin = QuestionOrigin::default();

        let first = ledger
            .record_question(&scope("b1"), INTERVIEW, "What was your first job?", &origin)
            .await
            .unwrap();
        let second = ledger
            .record_question(&scope("b1"), INTERVIEW, "what was your FIRST job", &origin)
            .await
            .unwrap();

        assert!(matches!(first, RecordOutcome::Recorded(_)));
        assert_eq!(second, RecordOutcome::Duplicate);
        assert_eq!(store.question_count().await, 1);
    }

    #[tokio::test]
    async fn reworded_question_with_same_keywords_is_a_duplicate() {
        let (_, ledger) = ledger();
        ledger
            .record_question(
                &scope("b1"),
                INTERVIEW,
                "What was your favourite place to play in Perth as a child?",
                &QuestionOrigin::default(),
            )
            .await
            .unwrap();

        assert!(
            ledger
                .is_duplicate(
                    &scope("b1"),
                    INTERVIEW,
                    "As a child, where was your favourite place to play in Perth?",
                )
                .await
                .unwrap()
        );
        assert!(
            !ledger
                .is_duplicate(&scope("b1"), INTERVIEW, "Who was your best friend at school?")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn duplicates_are_scoped_by_book_and_type() {
        let (store, ledger) = ledger();
        let text = "What did your father do for work?";
        let origin = QuestionOrigin::default();

        ledger
            .record_question(&scope("b1"), INTERVIEW, text, &origin)
            .await
            .unwrap();
        let other_book = ledger
            .record_question(&scope("b2"), INTERVIEW, text, &origin)
            .await
            .unwrap();
        let other_type = ledger
            .record_question(&scope("b1"), ConversationType::Reflection, text, &origin)
            .await
            .unwrap();
        let same = ledger
            .record_question(&scope("b1"), INTERVIEW, text, &origin)
            .await
            .unwrap();

        assert!(matches!(other_book, RecordOutcome::Recorded(_)));
        assert!(matches!(other_type, RecordOutcome::Recorded(_)));
        assert_eq!(same, RecordOutcome::Duplicate);
        assert_eq!(store.question_count().await, 3);
    }

    #[tokio::test]
    async fn concurrent_records_of_one_question_insert_once() {
        let (store, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .record_question(
                            &scope("b1"),
                            INTERVIEW,
                            "Where did you spend your summers?",
                            &QuestionOrigin::default(),
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.question_count().await, 1);
        assert!(ledger.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scope_locks_are_dropped_after_use() {
        let (_, ledger) = ledger();
        for book in ["b1", "b2", "b3"] {
            ledger
                .record_question(
                    &scope(book),
                    INTERVIEW,
                    "What did you study at school?",
                    &QuestionOrigin::default(),
                )
                .await
                .unwrap();
        }
        let _ = ledger
            .record_question(&scope("b4"), INTERVIEW, "  ", &QuestionOrigin::default())
            .await;
        assert!(ledger.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let (_, ledger) = ledger();
        let err = ledger
            .record_question(&scope("b1"), INTERVIEW, " ?! ", &QuestionOrigin::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoirError::Validation(_)));
        assert!(ledger.extract_questions("   ").is_empty());
    }

    #[tokio::test]
    async fn track_response_records_only_new_questions() {
        let (_, ledger) = ledger();
        let origin = QuestionOrigin::new(Some("c1"), Some("s1"));
        let reply = "Perth sounds lovely. What was your favourite place to play as a child?";

        let recorded = ledger
            .track_response(&scope("b1"), INTERVIEW, reply, &origin)
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].chapter_id.as_deref(), Some("c1"));
        assert_eq!(recorded[0].session_id.as_deref(), Some("s1"));
        assert!(recorded[0].response_quality.is_none());
        assert!(recorded[0].semantic_keywords.contains(&"favourite".to_string()));

        let again = ledger
            .track_response(&scope("b1"), INTERVIEW, reply, &origin)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn rating_is_validated_and_feeds_stats() {
        let (_, ledger) = ledger();
        let origin = QuestionOrigin::default();

        let empty = ledger.stats("alice", "b1").await.unwrap();
        assert_eq!(empty.total_questions, 0);
        assert_eq!(empty.average_quality, None);

        let RecordOutcome::Recorded(q1) = ledger
            .record_question(&scope("b1"), INTERVIEW, "Who taught you to cook?", &origin)
            .await
            .unwrap()
        else {
            panic!("expected a new question");
        };
        ledger
            .record_question(
                &scope("b1"),
                ConversationType::Brainstorming,
                "Which chapter should come next?",
                &origin,
            )
            .await
            .unwrap();

        for out_of_range in [0, 6, 300, -4] {
            assert!(matches!(
                ledger.rate("alice", &q1.id, out_of_range).await,
                Err(MemoirError::Validation(_))
            ));
        }
        assert!(!ledger.rate("bob", &q1.id, 1).await.unwrap());
        assert!(ledger.rate("alice", &q1.id, 4).await.unwrap());
        assert!(!ledger.rate("alice", "missing", 4).await.unwrap());

        let stats = ledger.stats("alice", "b1").await.unwrap();
        assert_eq!(stats.total_questions, 2);
        assert_eq!(stats.unique_questions, 2);
        assert_eq!(stats.counts_by_type.get(&INTERVIEW), Some(&1));
        assert_eq!(stats.average_quality, Some(4.0));
    }

    #[tokio::test]
    async fn recent_questions_are_newest_first() {
        let (_, ledger) = ledger();
        let origin = QuestionOrigin::default();
        for text in [
            "Where were you born?",
            "Who was your first teacher?",
            "What games did you play outside?",
        ] {
            ledger
                .record_question(&scope("b1"), INTERVIEW, text, &origin)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let recent = ledger
            .recent_questions(&scope("b1"), INTERVIEW, 2)
            .await
            .unwrap();
        let texts: Vec<&str> = recent.iter().map(|q| q.question_text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["What games did you play outside?", "Who was your first teacher?"]
        );
    }
}
