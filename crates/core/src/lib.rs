//! Conversation engine behind the memoir writing assistant.
//!
//! Text conversations run through a [`controller::SessionController`], voice
//! conversations through a [`relay::VoiceRelay`]. Both share the context
//! cache, the question ledger and the stores.

pub mod analytics;
pub mod completion;
pub mod context;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod model;
pub mod prompts;
pub mod relay;
pub mod store;

pub use error::{MemoirError, Result, UserFacingError};
