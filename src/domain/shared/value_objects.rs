//! Shared value objects used across the session engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which way a statistics window was collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Opened, nothing sent or received yet
    Open,
    /// Data flowing in at least one direction
    Active,
    /// Goodbye sent, still reading
    Closing,
    Closed,
}

/// Snapshot of the per-session counters.
///
/// Times are in milliseconds, jitter in timestamp units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub packets_received: u64,
    pub octets_received: u64,
    pub packets_lost: u64,
    pub packets_out_of_order: u64,
    pub packets_duplicated: u64,
    pub packets_too_late: u64,
    pub packets_rejected: u64,
    pub packets_malformed: u64,
    pub resynchronizations: u64,
    pub ssrc_changes: u32,
    pub average_send_time_ms: u32,
    pub minimum_send_time_ms: u32,
    pub maximum_send_time_ms: u32,
    pub average_receive_time_ms: u32,
    pub minimum_receive_time_ms: u32,
    pub maximum_receive_time_ms: u32,
    pub jitter: u32,
    pub maximum_jitter: u32,
    pub round_trip_ms: Option<u32>,
}

impl SessionStatistics {
    pub fn packet_loss_rate(&self) -> f64 {
        let expected = self.packets_received + self.packets_lost;
        if expected == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / expected as f64
    }
}
