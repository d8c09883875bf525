pub mod audio;
pub mod events;
pub mod session;

//re-export types for easier access
pub use events::{ClientFrameKind, ErrorDetails, RelayEvent, ServerFrame, SessionUpdateEvent};
pub use session::Session;
