//! CVE Feed Common Library
//!
//! Shared error handling and logging for the CVE feed workspace.
//!
//! # Overview
//!
//! This crate provides functionality used across all workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Logging**: Centralized `tracing` configuration and initialization
//!
//! # Example
//!
//! ```no_run
//! use cvefeed_common::logging::{LogConfig, init_logging};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     info!("Application started");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
