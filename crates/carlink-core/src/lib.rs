//! `carlink` Core Library
//!
//! Shared functionality for `carlink` components:
//! - Configuration resolution and hierarchy
//! - Tracing/logging initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{ChannelConfig, Config, LoggingConfig, StorageConfig, VerificationMode};
pub use error::{Error, Result};
