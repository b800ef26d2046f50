//! Shared kernel - types used by every layer of the session engine

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::{ErrorCategory, RtpSessionError};
pub use events::{DomainEvent, EventMetadata, SessionEvent, SessionEventKind};
pub use result::Result;
pub use value_objects::*;
