//! rtp-session - RTP/RTCP session engine
//!
//! Frames, sequences and statistics-tracks real-time media packets over a
//! data/control UDP pair, following RFC 3550.
//!
//! The pieces, leaves first:
//! - [`infrastructure::media::rtp`]: packet codecs, reports and the session
//!   state machine
//! - [`infrastructure::media::encoding`]: swappable wire encoding strategies
//! - [`infrastructure::media::transport`]: socket pair and read loop

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::{Config, SessionConfig, TransportConfig};
pub use domain::shared::error::{ErrorCategory, RtpSessionError};
pub use domain::shared::result::Result;
pub use infrastructure::media::{EncodingRegistry, MediaTransport, RtpPacket, RtpSession};
