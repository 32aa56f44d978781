//! Core types and utilities for chatgate
//!
//! # Modules
//!
//! - `config`: Environment file loading and typed `Settings`
//! - `error`: Error types and Result alias
//! - `types`: Transcript messages and tool-call descriptors shared by every crate

pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use config::{BusyPolicy, ProviderType, Settings};
pub use error::{Error, Result};
pub use types::*;
