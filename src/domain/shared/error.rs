//! Session engine errors

use crate::infrastructure::media::rtp::{RtcpError, RtpError};
use std::net::SocketAddr;
use thiserror::Error;

/// How an error is handled by the engine.
///
/// Only `TransportFatal` is ever surfaced to the opener as an `Err`; the
/// others are absorbed where they happen and show up in the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ProtocolViolation,
    SequenceAnomaly,
    TransportTransient,
    TransportFatal,
    PolicyReject,
}

#[derive(Error, Debug)]
pub enum RtpSessionError {
    #[error("RTP packet error: {0}")]
    Packet(#[from] RtpError),

    #[error("RTCP packet error: {0}")]
    Control(#[from] RtcpError),

    #[error("Sequence anomaly: {0}")]
    SequenceAnomaly(String),

    #[error("Unexpected source {0}")]
    UnexpectedSource(SocketAddr),

    #[error("Unexpected SSRC {0:08x}")]
    UnexpectedSsrc(u32),

    #[error("Write to {addr} failed transiently: {source}")]
    WriteTransient {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open socket pair: {0}")]
    OpenFailed(String),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session closed")]
    Closed,

    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),

    #[error("Protection hook failed: {0}")]
    Protection(String),
}

impl RtpSessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Packet(_) | Self::Control(_) | Self::Protection(_) => {
                ErrorCategory::ProtocolViolation
            }
            Self::SequenceAnomaly(_) => ErrorCategory::SequenceAnomaly,
            Self::UnexpectedSource(_) | Self::UnexpectedSsrc(_) => ErrorCategory::PolicyReject,
            Self::WriteTransient { .. } => ErrorCategory::TransportTransient,
            Self::OpenFailed(_)
            | Self::Io(_)
            | Self::Closed
            | Self::UnknownEncoding(_) => ErrorCategory::TransportFatal,
        }
    }

    /// Whether the error must abort the session.
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::TransportFatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            RtpSessionError::from(RtpError::BadVersion(1)).category(),
            ErrorCategory::ProtocolViolation
        );
        assert_eq!(
            RtpSessionError::UnexpectedSsrc(7).category(),
            ErrorCategory::PolicyReject
        );
        assert!(RtpSessionError::OpenFailed("no ports".into()).is_fatal());

        let transient = RtpSessionError::WriteTransient {
            addr: "127.0.0.1:4000".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(!transient.is_fatal());
    }
}
