//! Session events delivered to the owning call/media layer

use super::value_objects::{Direction, SessionId, SessionPhase, SessionStatistics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Base trait for all domain events
pub trait DomainEvent: Send + Sync {
    /// Returns the event type name
    fn event_type(&self) -> &'static str;

    /// Returns when the event occurred
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub session_id: SessionId,
}

impl EventMetadata {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            session_id,
        }
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEventKind {
    /// A statistics window filled up
    Statistics {
        direction: Direction,
        statistics: SessionStatistics,
    },
    /// Writes have been failing for longer than the configured threshold
    Failing {
        consecutive_failures: u32,
        remote: SocketAddr,
    },
    /// The remote sent a Goodbye
    GoodbyeReceived { ssrc: u32, reason: Option<String> },
    /// The remote asked for a full intra frame
    IntraFrameRequest { ssrc: u32 },
    /// The remote changed its synchronization source
    SsrcChanged { old: u32, new: u32 },
    PhaseChanged { from: SessionPhase, to: SessionPhase },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub metadata: EventMetadata,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, kind: SessionEventKind) -> Self {
        Self {
            metadata: EventMetadata::new(session_id),
            kind,
        }
    }
}

impl DomainEvent for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self.kind {
            SessionEventKind::Statistics { .. } => "session.statistics",
            SessionEventKind::Failing { .. } => "session.failing",
            SessionEventKind::GoodbyeReceived { .. } => "session.goodbye_received",
            SessionEventKind::IntraFrameRequest { .. } => "session.intra_frame_request",
            SessionEventKind::SsrcChanged { .. } => "session.ssrc_changed",
            SessionEventKind::PhaseChanged { .. } => "session.phase_changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}
