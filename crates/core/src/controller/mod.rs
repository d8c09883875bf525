//! Text-mode conversation controller.
//!
//! State transitions live in [`state::reduce`]; [`SessionController`] runs the
//! side effects (context load, completion calls, persistence, drafts,
//! question tracking) around them. The state mutex is never held across an
//! `.await`.

mod draft;
mod state;

pub use draft::DraftAutosaver;
pub use state::{ControllerEvent, ControllerState, Phase, reduce};

use crate::analytics::{ConversationAnalyzer, ConversationInsights, Suggestion};
use crate::completion::{BeginRequest, CompletionService, ContinueRequest, StyleHints};
use crate::context::ContextCache;
use crate::error::{MemoirError, Result};
use crate::ledger::{QuestionLedger, QuestionOrigin};
use crate::model::{
    ConversationContext, ConversationMedium, ConversationMessage, ConversationSession,
    ConversationType, ScopeKey,
};
use crate::store::{ConversationStore, DraftStore};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Collaborators shared by every controller of the process.
#[derive(Clone)]
pub struct ControllerDeps {
    pub conversations: Arc<dyn ConversationStore>,
    pub drafts: Arc<dyn DraftStore>,
    pub completion: Arc<dyn CompletionService>,
    pub contexts: Arc<ContextCache>,
    pub ledger: Arc<QuestionLedger>,
    pub analyzer: ConversationAnalyzer,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub history_limit: usize,
    pub draft_debounce: Duration,
    /// How many recent questions are passed to the completion as ones to avoid.
    pub avoid_question_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            draft_debounce: Duration::from_millis(1000),
            avoid_question_limit: 10,
        }
    }
}

/// The user, book and chapter a controller works in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControllerScope {
    pub user_id: String,
    pub book_id: String,
    pub chapter_id: Option<String>,
}

impl ControllerScope {
    pub fn new(user_id: &str, book_id: &str, chapter_id: Option<&str>) -> Self {
        Self {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            chapter_id: chapter_id.map(str::to_string),
        }
    }

    fn question_scope(&self) -> ScopeKey {
        ScopeKey::new(&self.user_id, &self.book_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendOutcome {
    pub user_message: ConversationMessage,
    /// `None` for self conversations, which have no AI turn.
    pub reply: Option<ConversationMessage>,
}

/// Removes a session id from the delete-in-flight set when dropped.
struct DeleteGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for DeleteGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}

pub struct SessionController {
    scope: ControllerScope,
    deps: ControllerDeps,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    deleting: Mutex<HashSet<String>>,
    tasks: Mutex<JoinSet<()>>,
    autosaver: DraftAutosaver,
}

impl SessionController {
    pub fn new(scope: ControllerScope, deps: ControllerDeps, config: ControllerConfig) -> Self {
        let autosaver =
            DraftAutosaver::new(deps.drafts.clone(), &scope.user_id, config.draft_debounce);
        Self {
            scope,
            deps,
            config,
            state: Mutex::new(ControllerState::default()),
            deleting: Mutex::new(HashSet::new()),
            tasks: Mutex::new(JoinSet::new()),
            autosaver,
        }
    }

    pub fn scope(&self) -> &ControllerScope {
        &self.scope
    }

    pub fn snapshot(&self) -> ControllerState {
        self.lock_state().clone()
    }

    pub fn current_session(&self) -> Option<ConversationSession> {
        self.lock_state().session.clone()
    }

    pub async fn start_conversation(
        &self,
        conversation_type: ConversationType,
        medium: ConversationMedium,
    ) -> Result<ConversationSession> {
        self.dispatch(ControllerEvent::StartRequested)?;
        info!(
            user_id = %self.scope.user_id,
            book_id = %self.scope.book_id,
            %conversation_type,
            "starting conversation"
        );

        let context = match self.load_context().await {
            Ok(context) => context,
            Err(err) => return Err(self.fail_start(err)),
        };
        let style_hints = StyleHints {
            avoid_questions: self.avoid_questions(conversation_type).await,
            ..Default::default()
        };
        let response = match self
            .deps
            .completion
            .begin(BeginRequest {
                context: context.clone(),
                conversation_type,
                style_hints: Some(style_hints),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("completion begin failed: {e:#}");
                return Err(self.fail_start(MemoirError::service(
                    "Could not start the conversation",
                    "The interviewer is unavailable right now. Please try again.",
                )));
            }
        };

        let mut session = ConversationSession::new(
            response.session_id,
            &self.scope.user_id,
            &self.scope.book_id,
            self.scope.chapter_id.clone(),
            conversation_type,
            medium,
            (*context).clone(),
        );
        if !response.goals.is_empty() {
            session.goals = response.goals;
        }
        let opening = ConversationMessage::assistant(response.assistant_text);
        session.append(opening.clone());

        self.dispatch(ControllerEvent::StartSucceeded(session.clone()))?;
        self.track_questions(&session, &opening.content);
        self.persist(&session).await?;
        Ok(session)
    }

    /// Starts a session where the user writes alone, without AI turns.
    pub async fn start_self_conversation(
        &self,
        conversation_type: ConversationType,
    ) -> Result<ConversationSession> {
        self.dispatch(ControllerEvent::StartRequested)?;
        let context = match self.load_context().await {
            Ok(context) => context,
            Err(err) => return Err(self.fail_start(err)),
        };

        let mut session = ConversationSession::new(
            Uuid::new_v4().to_string(),
            &self.scope.user_id,
            &self.scope.book_id,
            self.scope.chapter_id.clone(),
            conversation_type,
            ConversationMedium::Text,
            (*context).clone(),
        );
        session.is_self_conversation = true;

        self.dispatch(ControllerEvent::StartSucceeded(session.clone()))?;
        info!(session_id = %session.session_id, "self conversation started");
        self.persist(&session).await?;
        Ok(session)
    }

    pub async fn send_message(&self, text: &str) -> Result<SendOutcome> {
        let content = text.trim();
        if content.is_empty() {
            return Err(MemoirError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let state = self.dispatch(ControllerEvent::SendRequested(ConversationMessage::user(
            content,
        )))?;
        let session = state.session.ok_or(MemoirError::NoActiveSession)?;
        let user_message = session
            .last_message()
            .cloned()
            .ok_or(MemoirError::NoActiveSession)?;
        let session_id = session.session_id.clone();
        self.autosaver.cancel(&session_id);

        if let Err(err) = self.persist(&session).await {
            self.dispatch(ControllerEvent::SendFailed {
                session_id,
                error: err.user_facing(),
            })?;
            return Err(err);
        }

        if session.is_self_conversation {
            self.dispatch(ControllerEvent::SendCompleted {
                session_id: session_id.clone(),
                reply: None,
            })?;
            self.clear_stored_draft(&session_id).await;
            return Ok(SendOutcome {
                user_message,
                reply: None,
            });
        }

        let style_hints = StyleHints {
            style: self.deps.analyzer.optimal_style(&session.messages),
            avoid_questions: self.avoid_questions(session.conversation_type).await,
        };
        let request = ContinueRequest {
            session_id: session_id.clone(),
            messages: session.messages.clone(),
            conversation_type: session.conversation_type,
            context: Arc::new(session.context.clone()),
            style_hints: Some(style_hints),
        };

        let response = match self.deps.completion.continue_session(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%session_id, "completion continue failed: {e:#}");
                let err = MemoirError::service(
                    "Message not answered",
                    "Your message was saved, but the interviewer could not reply. Please try again.",
                );
                self.dispatch(ControllerEvent::SendFailed {
                    session_id,
                    error: err.user_facing(),
                })?;
                return Err(err);
            }
        };

        let reply = ConversationMessage::assistant(response.assistant_text);
        let state = self.dispatch(ControllerEvent::SendCompleted {
            session_id: session_id.clone(),
            reply: Some(reply.clone()),
        })?;
        self.track_questions(&session, &reply.content);

        match state.session.filter(|s| s.session_id == session_id) {
            Some(current) => {
                let reply = current.last_message().cloned().unwrap_or(reply);
                self.persist(&current).await?;
                self.clear_stored_draft(&session_id).await;
                Ok(SendOutcome {
                    user_message,
                    reply: Some(reply),
                })
            }
            None => {
                // Deleted while the reply was in flight. Keep an existing
                // record complete without recreating a deleted one.
                let mut messages = session.messages.clone();
                messages.push(reply.clone());
                if let Err(e) = self
                    .deps
                    .conversations
                    .replace_messages(&session_id, &self.scope.user_id, &messages)
                    .await
                {
                    warn!(%session_id, "late reply not saved: {e:#}");
                }
                Ok(SendOutcome {
                    user_message,
                    reply: Some(reply),
                })
            }
        }
    }

    /// Makes `session` the current one. No network call is made.
    pub fn resume_conversation(&self, session: ConversationSession) -> Result<()> {
        if session.user_id != self.scope.user_id {
            return Err(MemoirError::not_found("conversation", session.session_id));
        }
        info!(session_id = %session.session_id, "resuming conversation");
        self.dispatch(ControllerEvent::Resumed(session))?;
        Ok(())
    }

    /// Loads a persisted session of this user by id.
    pub async fn load_session(&self, session_id: &str) -> Result<ConversationSession> {
        let record = self
            .deps
            .conversations
            .find(session_id, &self.scope.user_id)
            .await
            .map_err(|e| MemoirError::Persistence(format!("{e:#}")))?
            .ok_or_else(|| MemoirError::not_found("conversation", session_id))?;
        Ok(ConversationSession::from_record(&record))
    }

    /// Clears the current session. Persisted data is left untouched.
    pub async fn end_conversation(&self) -> Result<()> {
        let state = self.dispatch(ControllerEvent::EndRequested)?;
        if let Err(e) = self.autosaver.flush().await {
            warn!("failed to save draft while ending: {e:#}");
        }
        self.dispatch(ControllerEvent::Ended)?;
        if let Some(session) = state.session {
            info!(session_id = %session.session_id, "conversation ended");
        }
        Ok(())
    }

    /// Deletes the session record and its draft.
    ///
    /// A delete of a session whose delete is already in flight is a no-op
    /// returning `false`.
    pub async fn delete_conversation(&self, session_id: &str) -> Result<bool> {
        let _guard = {
            let mut deleting = self.deleting.lock().unwrap_or_else(|e| e.into_inner());
            if !deleting.insert(session_id.to_string()) {
                debug!(session_id, "delete already in flight");
                return Ok(false);
            }
            DeleteGuard {
                set: &self.deleting,
                session_id: session_id.to_string(),
            }
        };

        self.autosaver.cancel(session_id);
        let removed = self
            .deps
            .conversations
            .delete(session_id, &self.scope.user_id)
            .await
            .map_err(|e| MemoirError::Persistence(format!("{e:#}")))?;
        self.clear_stored_draft(session_id).await;
        self.dispatch(ControllerEvent::Deleted {
            session_id: session_id.to_string(),
        })?;
        info!(session_id, removed, "conversation deleted");
        Ok(removed)
    }

    pub async fn get_draft(&self) -> Result<Option<String>> {
        let session_id = self.current_session_id()?;
        self.deps
            .drafts
            .get_draft(&self.scope.user_id, &session_id)
            .await
            .map_err(|e| MemoirError::Persistence(format!("{e:#}")))
    }

    /// Schedules a debounced save of the unsent input.
    pub fn set_draft(&self, text: &str) -> Result<()> {
        let session_id = self.current_session_id()?;
        self.autosaver.schedule(&session_id, text);
        Ok(())
    }

    pub async fn clear_draft(&self) -> Result<()> {
        let session_id = self.current_session_id()?;
        self.autosaver.cancel(&session_id);
        self.deps
            .drafts
            .clear_draft(&self.scope.user_id, &session_id)
            .await
            .map_err(|e| MemoirError::Persistence(format!("{e:#}")))
    }

    /// The user's most recent sessions, newest first.
    pub async fn load_history(&self) -> Result<Vec<ConversationSession>> {
        let records = self
            .deps
            .conversations
            .list_recent(&self.scope.user_id, self.config.history_limit)
            .await
            .map_err(|e| MemoirError::Persistence(format!("{e:#}")))?;
        Ok(records.iter().map(ConversationSession::from_record).collect())
    }

    pub fn conversation_insights(&self) -> Result<ConversationInsights> {
        let session = self.current_session().ok_or(MemoirError::NoActiveSession)?;
        Ok(self.deps.analyzer.insights(&session.messages))
    }

    pub fn continuation_suggestions(&self) -> Result<Vec<Suggestion>> {
        let session = self.current_session().ok_or(MemoirError::NoActiveSession)?;
        Ok(self.deps.analyzer.continuation_suggestions(&session.messages))
    }

    pub fn is_healthy_conversation(&self) -> Result<bool> {
        let session = self.current_session().ok_or(MemoirError::NoActiveSession)?;
        Ok(self.deps.analyzer.is_healthy_conversation(&session.messages))
    }

    /// Collects finished background tasks and returns how many still run.
    pub fn background_tasks(&self) -> usize {
        let mut tasks = self.lock_tasks();
        reap_finished(&mut tasks);
        tasks.len()
    }

    /// True when there is no session and no background work, so the
    /// controller can be dropped without losing anything.
    pub fn is_idle(&self) -> bool {
        let idle = {
            let state = self.lock_state();
            state.phase == Phase::Idle && state.session.is_none()
        };
        idle && self.background_tasks() == 0
    }

    /// Waits for every background task spawned so far.
    pub async fn drain_background_tasks(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!("background task panicked: {e}");
                }
            }
        }
    }

    fn dispatch(&self, event: ControllerEvent) -> Result<ControllerState> {
        let mut state = self.lock_state();
        let next = reduce(&state, event)?;
        *state = next.clone();
        Ok(next)
    }

    fn fail_start(&self, err: MemoirError) -> MemoirError {
        let mut state = self.lock_state();
        if let Ok(next) = reduce(&state, ControllerEvent::StartFailed(err.user_facing())) {
            *state = next;
        }
        err
    }

    async fn load_context(&self) -> Result<Arc<ConversationContext>> {
        self.deps
            .contexts
            .get_context(
                &self.scope.user_id,
                &self.scope.book_id,
                self.scope.chapter_id.as_deref(),
            )
            .await
            .map_err(|e| {
                warn!("context build failed: {e:#}");
                MemoirError::service(
                    "Could not load your story",
                    "We could not load your book details. Please try again.",
                )
            })
    }

    async fn avoid_questions(&self, conversation_type: ConversationType) -> Vec<String> {
        match self
            .deps
            .ledger
            .recent_questions(
                &self.scope.question_scope(),
                conversation_type,
                self.config.avoid_question_limit,
            )
            .await
        {
            Ok(questions) => questions.into_iter().map(|q| q.question_text).collect(),
            Err(e) => {
                warn!("could not load recent questions: {e}");
                Vec::new()
            }
        }
    }

    async fn persist(&self, session: &ConversationSession) -> Result<()> {
        if let Err(e) = self.deps.conversations.save(&session.to_record()).await {
            let err = MemoirError::Persistence(format!("{e:#}"));
            warn!(session_id = %session.session_id, "failed to save conversation: {e:#}");
            let _ = self.dispatch(ControllerEvent::ErrorRaised(err.user_facing()));
            return Err(err);
        }
        debug!(
            session_id = %session.session_id,
            messages = session.messages.len(),
            "conversation saved"
        );
        Ok(())
    }

    async fn clear_stored_draft(&self, session_id: &str) {
        if let Err(e) = self
            .deps
            .drafts
            .clear_draft(&self.scope.user_id, session_id)
            .await
        {
            warn!(session_id, "failed to clear draft: {e:#}");
        }
    }

    /// Runs the question pipeline for an assistant turn in the background.
    fn track_questions(&self, session: &ConversationSession, assistant_text: &str) {
        let ledger = self.deps.ledger.clone();
        let scope = self.scope.question_scope();
        let conversation_type = session.conversation_type;
        let origin = QuestionOrigin::new(
            session.chapter_id.as_deref(),
            Some(session.session_id.as_str()),
        );
        let text = assistant_text.to_string();
        let mut tasks = self.lock_tasks();
        reap_finished(&mut tasks);
        tasks.spawn(async move {
            if let Err(e) = ledger
                .track_response(&scope, conversation_type, &text, &origin)
                .await
            {
                warn!(session_id = ?origin.session_id, "question tracking failed: {e}");
            }
        });
    }

    fn current_session_id(&self) -> Result<String> {
        self.lock_state()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or(MemoirError::NoActiveSession)
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                warn!("background task panicked: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests;
