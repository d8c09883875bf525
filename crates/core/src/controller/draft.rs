use crate::store::DraftStore;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct PendingDraft {
    session_id: String,
    text: String,
    handle: JoinHandle<()>,
}

/// Debounced writer of the unsent input of one user.
///
/// Each `schedule` replaces the pending write and restarts the idle timer,
/// so a burst of keystrokes results in a single store write.
pub struct DraftAutosaver {
    store: Arc<dyn DraftStore>,
    user_id: String,
    debounce: Duration,
    pending: Mutex<Option<PendingDraft>>,
}

impl DraftAutosaver {
    pub fn new(store: Arc<dyn DraftStore>, user_id: &str, debounce: Duration) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            debounce,
            pending: Mutex::new(None),
        }
    }

    pub fn schedule(&self, session_id: &str, text: &str) {
        let store = self.store.clone();
        let user_id = self.user_id.clone();
        let debounce = self.debounce;
        let owned_session = session_id.to_string();
        let owned_text = text.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            match store
                .set_draft(&user_id, &owned_session, &owned_text)
                .await
            {
                Ok(()) => debug!(session_id = %owned_session, "draft saved"),
                Err(e) => warn!(session_id = %owned_session, "failed to save draft: {e:#}"),
            }
        });

        let previous = self.pending().replace(PendingDraft {
            session_id: session_id.to_string(),
            text: text.to_string(),
            handle,
        });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Writes a pending draft immediately instead of waiting for the timer.
    pub async fn flush(&self) -> Result<()> {
        let Some(pending) = self.pending().take() else {
            return Ok(());
        };
        if pending.handle.is_finished() {
            return Ok(());
        }
        pending.handle.abort();
        self.store
            .set_draft(&self.user_id, &pending.session_id, &pending.text)
            .await
    }

    /// Drops a pending write for the session without saving it.
    pub fn cancel(&self, session_id: &str) {
        let mut pending = self.pending();
        if pending
            .as_ref()
            .is_some_and(|p| p.session_id == session_id)
        {
            if let Some(p) = pending.take() {
                p.handle.abort();
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<PendingDraft>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DraftAutosaver {
    fn drop(&mut self) {
        if let Some(pending) = self.pending().take() {
            pending.handle.abort();
        }
    }
}
