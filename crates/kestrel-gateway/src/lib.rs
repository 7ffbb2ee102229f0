//! The channel gateway: fan-in from heterogeneous IM adapters into
//! per-chat sessions, fan-out of replies, command interception, and the
//! process wiring that assembles the whole runtime.

pub mod adapter;
pub mod app;
pub mod error;
pub mod gateway;
pub mod selfcheck;
pub mod types;

pub use adapter::ChannelAdapter;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use types::{FileAttachment, ImageAttachment, InboundMessage, VoiceAttachment};
