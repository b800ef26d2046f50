//! Domain layer - Core types shared by the engine
//!
//! This layer contains:
//! - Value Objects: session identity, phases and statistics
//! - Domain Events: things that happened to a session
//! - Errors and their handling categories

pub mod shared;

// Re-export commonly used types
pub use shared::{Result, RtpSessionError};
