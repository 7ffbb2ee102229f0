//! Shared configuration, identity files, and the process-level error type.
//!
//! Everything here is leaf-level: no other kestrel crate is a dependency.

pub mod config;
pub mod error;
pub mod identity;

pub use config::KestrelConfig;
pub use error::{KestrelError, Result};
