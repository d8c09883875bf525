//! Error types for the conversation engine.

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the controller, ledger and relay.
///
/// Collaborator traits (stores, builders, completion, upstream) return
/// `anyhow::Result`; those failures are folded into the `Service`,
/// `Persistence` and `Connection` variants at the component boundary.
#[derive(Debug, Error)]
pub enum MemoirError {
    /// Input rejected before any side effect
    #[error("invalid input: {0}")]
    Validation(String),

    /// Another operation of the same kind is still in flight
    #[error("a {operation} is already in progress")]
    Busy { operation: &'static str },

    #[error("no active conversation")]
    NoActiveSession,

    /// An external service (completion, context build) failed
    #[error("{title}: {description}")]
    Service { title: String, description: String },

    #[error("failed to save conversation: {0}")]
    Persistence(String),

    /// Voice relay connection failures
    #[error("connection error ({code}): {message}")]
    Connection { code: &'static str, message: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// The short title and description shown to a user for a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserFacingError {
    pub title: String,
    pub description: String,
}

impl MemoirError {
    pub fn service(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Service {
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn connection(code: &'static str, message: impl Into<String>) -> Self {
        Self::Connection {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn user_facing(&self) -> UserFacingError {
        let (title, description) = match self {
            MemoirError::Validation(message) => ("Check your input", message.clone()),
            MemoirError::Busy { .. } => (
                "Please wait",
                "The previous request is still being processed.".to_string(),
            ),
            MemoirError::NoActiveSession => (
                "No conversation",
                "Start or resume a conversation first.".to_string(),
            ),
            MemoirError::Service { title, description } => {
                return UserFacingError {
                    title: title.clone(),
                    description: description.clone(),
                };
            }
            MemoirError::Persistence(_) => (
                "Not saved",
                "Your conversation could not be saved. Your messages are kept; please try again."
                    .to_string(),
            ),
            MemoirError::Connection { .. } => (
                "Connection lost",
                "The voice connection could not be kept open. Please reconnect.".to_string(),
            ),
            MemoirError::NotFound { entity, .. } => {
                ("Not found", format!("That {entity} no longer exists."))
            }
            MemoirError::Config(_) => (
                "Service unavailable",
                "The service is not configured correctly. Please contact support.".to_string(),
            ),
        };
        UserFacingError {
            title: title.to_string(),
            description,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_facing_messages_hide_internal_detail() {
        let err = MemoirError::Persistence("disk I/O error at /var/lib/memoir.db".to_string());
        let shown = err.user_facing();
        assert_eq!(shown.title, "Not saved");
        assert!(!shown.description.contains("/var/lib"));

        let err = MemoirError::service("Reply failed", "The interviewer did not respond.");
        assert_eq!(err.user_facing().description, "The interviewer did not respond.");
    }
}
