//! Session engine result type

use super::error::RtpSessionError;

/// Standard result type for session engine operations
pub type Result<T> = std::result::Result<T, RtpSessionError>;
