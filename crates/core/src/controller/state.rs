use crate::error::{MemoirError, UserFacingError};
use crate::model::{ConversationMessage, ConversationSession};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Active,
    Sending,
    Ending,
}

impl Phase {
    fn is_busy(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Sending | Phase::Ending)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerState {
    pub phase: Phase,
    pub session: Option<ConversationSession>,
    pub last_error: Option<UserFacingError>,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StartRequested,
    StartSucceeded(ConversationSession),
    StartFailed(UserFacingError),
    /// The user message is appended before the completion call.
    SendRequested(ConversationMessage),
    SendCompleted {
        session_id: String,
        reply: Option<ConversationMessage>,
    },
    SendFailed {
        session_id: String,
        error: UserFacingError,
    },
    Resumed(ConversationSession),
    EndRequested,
    Ended,
    Deleted {
        session_id: String,
    },
    ErrorRaised(UserFacingError),
}

fn busy(phase: Phase, operation: &'static str) -> Result<(), MemoirError> {
    if phase.is_busy() {
        return Err(MemoirError::Busy { operation });
    }
    Ok(())
}

fn is_current(state: &ControllerState, session_id: &str) -> bool {
    state
        .session
        .as_ref()
        .is_some_and(|s| s.session_id == session_id)
}

/// Applies one event to the controller state.
///
/// Returns the rejection instead of a new state when the event is not
/// allowed in the current phase. Completions for a session that is no longer
/// current, and start outcomes that arrive outside `Starting`, leave the
/// state unchanged.
pub fn reduce(
    state: &ControllerState,
    event: ControllerEvent,
) -> Result<ControllerState, MemoirError> {
    let mut next = state.clone();
    match event {
        ControllerEvent::StartRequested => {
            busy(state.phase, "start")?;
            next.phase = Phase::Starting;
            next.session = None;
            next.last_error = None;
        }
        ControllerEvent::StartSucceeded(session) => {
            if state.phase != Phase::Starting {
                return Ok(next);
            }
            next.phase = Phase::Active;
            next.session = Some(session);
        }
        ControllerEvent::StartFailed(error) => {
            if state.phase != Phase::Starting {
                return Ok(next);
            }
            next.phase = Phase::Idle;
            next.session = None;
            next.last_error = Some(error);
        }
        ControllerEvent::SendRequested(message) => {
            busy(state.phase, "send")?;
            let session = next.session.as_mut().ok_or(MemoirError::NoActiveSession)?;
            session.append(message);
            next.phase = Phase::Sending;
            next.last_error = None;
        }
        ControllerEvent::SendCompleted { session_id, reply } => {
            if !is_current(state, &session_id) {
                return Ok(next);
            }
            if let (Some(session), Some(reply)) = (next.session.as_mut(), reply) {
                session.append(reply);
            }
            next.phase = Phase::Active;
        }
        ControllerEvent::SendFailed { session_id, error } => {
            if !is_current(state, &session_id) {
                return Ok(next);
            }
            next.phase = Phase::Active;
            next.last_error = Some(error);
        }
        ControllerEvent::Resumed(session) => {
            busy(state.phase, "resume")?;
            next.phase = Phase::Active;
            next.session = Some(session);
            next.last_error = None;
        }
        ControllerEvent::EndRequested => {
            busy(state.phase, "end")?;
            next.phase = Phase::Ending;
        }
        ControllerEvent::Ended => {
            next.phase = Phase::Idle;
            next.session = None;
        }
        ControllerEvent::Deleted { session_id } => {
            if is_current(state, &session_id) {
                next.phase = Phase::Idle;
                next.session = None;
            }
        }
        ControllerEvent::ErrorRaised(error) => {
            next.last_error = Some(error);
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationContext, ConversationMedium, ConversationType};

    fn session(id: &str) -> ConversationSession {
        ConversationSession::new(
            id,
            "u1",
            "b1",
            None,
            ConversationType::Interview,
            ConversationMedium::Text,
            ConversationContext::default(),
        )
    }

    fn active(id: &str) -> ControllerState {
        ControllerState {
            phase: Phase::Active,
            session: Some(session(id)),
            last_error: None,
        }
    }

    fn error() -> UserFacingError {
        UserFacingError {
            title: "t".into(),
            description: "d".into(),
        }
    }

    #[test]
    fn start_is_rejected_while_busy() {
        let starting = reduce(&ControllerState::default(), ControllerEvent::StartRequested).unwrap();
        assert_eq!(starting.phase, Phase::Starting);
        assert!(matches!(
            reduce(&starting, ControllerEvent::StartRequested),
            Err(MemoirError::Busy { operation: "start" })
        ));

        let sending = reduce(
            &active("s1"),
            ControllerEvent::SendRequested(ConversationMessage::user("hi")),
        )
        .unwrap();
        assert!(matches!(
            reduce(&sending, ControllerEvent::StartRequested),
            Err(MemoirError::Busy { .. })
        ));
        assert!(matches!(
            reduce(
                &sending,
                ControllerEvent::SendRequested(ConversationMessage::user("again"))
            ),
            Err(MemoirError::Busy { operation: "send" })
        ));
    }

    #[test]
    fn failed_start_leaves_no_session() {
        let state = reduce(&active("old"), ControllerEvent::StartRequested).unwrap();
        let state = reduce(&state, ControllerEvent::StartFailed(error())).unwrap();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.session.is_none());
        assert_eq!(state.last_error, Some(error()));
    }

    #[test]
    fn send_appends_optimistically_and_keeps_it_on_failure() {
        let state = reduce(
            &active("s1"),
            ControllerEvent::SendRequested(ConversationMessage::user("I grew up in Perth.")),
        )
        .unwrap();
        assert_eq!(state.phase, Phase::Sending);

        let state = reduce(
            &state,
            ControllerEvent::SendFailed {
                session_id: "s1".into(),
                error: error(),
            },
        )
        .unwrap();
        assert_eq!(state.phase, Phase::Active);
        let messages = &state.session.as_ref().unwrap().messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "I grew up in Perth.");
    }

    #[test]
    fn send_without_session_is_rejected() {
        assert!(matches!(
            reduce(
                &ControllerState::default(),
                ControllerEvent::SendRequested(ConversationMessage::user("hi"))
            ),
            Err(MemoirError::NoActiveSession)
        ));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let state = reduce(
            &active("s2"),
            ControllerEvent::SendCompleted {
                session_id: "s1".into(),
                reply: Some(ConversationMessage::assistant("late")),
            },
        )
        .unwrap();
        assert_eq!(state.phase, Phase::Active);
        assert!(state.session.unwrap().messages.is_empty());
    }

    #[test]
    fn end_and_delete_clear_the_current_session() {
        let ending = reduce(&active("s1"), ControllerEvent::EndRequested).unwrap();
        assert_eq!(ending.phase, Phase::Ending);
        let ended = reduce(&ending, ControllerEvent::Ended).unwrap();
        assert_eq!(ended.phase, Phase::Idle);
        assert!(ended.session.is_none());

        let other = reduce(
            &active("s1"),
            ControllerEvent::Deleted {
                session_id: "s9".into(),
            },
        )
        .unwrap();
        assert_eq!(other.phase, Phase::Active);
        let deleted = reduce(
            &active("s1"),
            ControllerEvent::Deleted {
                session_id: "s1".into(),
            },
        )
        .unwrap();
        assert!(deleted.session.is_none());
    }

    #[test]
    fn end_is_rejected_while_a_start_or_send_is_in_flight() {
        let starting = reduce(&ControllerState::default(), ControllerEvent::StartRequested).unwrap();
        assert!(matches!(
            reduce(&starting, ControllerEvent::EndRequested),
            Err(MemoirError::Busy { operation: "end" })
        ));

        let sending = reduce(
            &active("s1"),
            ControllerEvent::SendRequested(ConversationMessage::user("hi")),
        )
        .unwrap();
        assert!(matches!(
            reduce(&sending, ControllerEvent::EndRequested),
            Err(MemoirError::Busy { operation: "end" })
        ));
    }

    #[test]
    fn start_outcome_outside_starting_is_ignored() {
        let idle = ControllerState::default();
        let late = reduce(&idle, ControllerEvent::StartSucceeded(session("late"))).unwrap();
        assert_eq!(late, idle);

        let current = active("s1");
        let late_failure = reduce(&current, ControllerEvent::StartFailed(error())).unwrap();
        assert_eq!(late_failure, current);
    }
}
