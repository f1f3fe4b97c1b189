//! # Courier Core
//!
//! Core types and error handling for the Courier API client.
//!
//! This crate provides the configuration graph the scripting layer reads:
//! - Workspace, request and script definitions
//! - Engine language tags and their aliases
//! - Error types

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod language;
pub mod types;

pub use error::{Error, Result};
pub use language::ScriptLanguage;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::language::ScriptLanguage;
    pub use crate::types::*;
}
