//! Core library for Agent Hub
//!
//! This crate contains the session-scoped building blocks, including:
//! - Session state (history, tool/model configuration, dirty flags)
//! - Execution context tracking for tool invocations
//! - Canonical streaming events
//! - Runtime configuration and logging bootstrap

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod logging;
pub mod message;
pub mod session;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
