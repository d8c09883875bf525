mod client;
mod link;

pub use client::config::{Config, ConfigBuilder};
pub use client::connect;
pub use link::{Frame, Link};
pub use memoir_realtime_types as types;
