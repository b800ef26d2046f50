//! RTP Session state machine
//!
//! Owns sequencing, synchronization-source tracking, RFC 3550 statistics and
//! report scheduling for one media session. All mutable state sits behind a
//! single mutex; the canonical/tool names have their own, narrower lock so a
//! configuration path can update them at any time.

use super::packet::RtpPacket;
use super::report::{self, ControlHandler};
use super::rtcp::{
    ntp_middle32, ntp_now, ApplicationDefined, Goodbye, IntraFrameRequest, ReceptionReport,
    RtcpCompound, RtcpPacket, SdesItemType, SenderReport, SourceDescription,
};
use super::timer::ReportTimer;
use crate::config::{MediaKind, SessionConfig};
use crate::domain::shared::{
    Direction, Result, RtpSessionError, SessionEvent, SessionEventKind, SessionId, SessionPhase,
    SessionStatistics,
};
use crate::infrastructure::media::metrics;
use bytes::Bytes;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The jitter accumulator keeps this many fractional bits (RFC 3550 §A.8)
pub const JITTER_GUARD_BITS: u32 = 4;

/// Sequence numbers behind the highest one whose arrival is remembered
const MISSING_WINDOW: u32 = 64;

/// Why a received packet was not handed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    BadVersion,
    UnexpectedSsrc,
    PayloadTypeChanged,
    OutOfOrder,
    Duplicate,
    Closed,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadVersion => "bad_version",
            Self::UnexpectedSsrc => "unexpected_ssrc",
            Self::PayloadTypeChanged => "payload_type_changed",
            Self::OutOfOrder => "out_of_order",
            Self::Duplicate => "duplicate",
            Self::Closed => "closed",
        }
    }
}

/// What a packet behind the highest sequence turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LateArrival {
    /// Fills a gap that was counted as lost
    FilledGap,
    /// Already received
    Duplicate,
    /// Too far back to tell
    Unknown,
}

/// Result of feeding a packet into the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Pass the packet on to the jitter buffer
    Deliver,
    Discard(DiscardReason),
}

/// Rolling min/avg/max of inter-packet times over a packet window
#[derive(Debug, Default)]
pub(crate) struct IntervalWindow {
    packets: u32,
    samples: u32,
    total_ms: u64,
    min_ms: u32,
    max_ms: u32,
    pub(crate) average_ms: u32,
    pub(crate) minimum_ms: u32,
    pub(crate) maximum_ms: u32,
}

impl IntervalWindow {
    fn count_packet(&mut self) {
        self.packets += 1;
    }

    fn record(&mut self, interval: Duration) {
        let ms = interval.as_millis().min(u32::MAX as u128) as u32;
        if self.samples == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        self.max_ms = self.max_ms.max(ms);
        self.total_ms += ms as u64;
        self.samples += 1;
    }

    /// Publishes the window once `size` packets were counted
    fn flush_if_full(&mut self, size: u32) -> bool {
        if size == 0 || self.packets < size {
            return false;
        }
        if self.samples > 0 {
            self.average_ms = (self.total_ms / self.samples as u64) as u32;
            self.minimum_ms = self.min_ms;
            self.maximum_ms = self.max_ms;
        }
        *self = Self {
            average_ms: self.average_ms,
            minimum_ms: self.minimum_ms,
            maximum_ms: self.maximum_ms,
            ..Default::default()
        };
        true
    }
}

/// Mutable per-session state, guarded by the session lock
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) phase: SessionPhase,
    pub(crate) epoch: Instant,

    // Outgoing
    pub(crate) ssrc_out: u32,
    pub(crate) last_sent_sequence: u16,
    pub(crate) last_sent_timestamp: u32,
    pub(crate) last_sent_at: Option<Instant>,
    pub(crate) timestamp_offset: Option<u32>,
    pub(crate) packets_sent: u64,
    pub(crate) octets_sent: u64,
    pub(crate) tx_window: IntervalWindow,

    // Incoming
    pub(crate) ssrc_in: Option<u32>,
    pub(crate) ssrc_changes: u32,
    pub(crate) receiving: bool,
    pub(crate) expected_sequence: u16,
    pub(crate) highest_sequence: u16,
    pub(crate) sequence_cycles: u32,
    pub(crate) consecutive_out_of_order: u32,
    /// Bit `n` set: `highest_sequence - n - 1` has not arrived
    pub(crate) missing: u64,
    /// How many sequences behind the highest `missing` describes
    pub(crate) tracked: u32,
    pub(crate) last_payload_type: Option<u8>,
    pub(crate) last_received_at: Option<Instant>,
    pub(crate) last_transit: Option<i32>,
    pub(crate) jitter_level: u32,
    pub(crate) max_jitter_level: u32,
    pub(crate) packets_received: u64,
    pub(crate) octets_received: u64,
    pub(crate) packets_lost: u64,
    pub(crate) lost_since_last_rr: u64,
    pub(crate) last_rr_sequence: u16,
    pub(crate) packets_out_of_order: u64,
    pub(crate) packets_duplicated: u64,
    pub(crate) packets_too_late: u64,
    pub(crate) packets_rejected: u64,
    pub(crate) packets_malformed: u64,
    pub(crate) resynchronizations: u64,
    pub(crate) rx_window: IntervalWindow,

    // Control
    pub(crate) last_sr_ntp_middle: u32,
    pub(crate) last_sr_received_at: Option<Instant>,
    pub(crate) round_trip_ms: Option<u32>,
    pub(crate) remote_canonical_name: Option<String>,
    pub(crate) bye_sent: bool,
    pub(crate) timer: ReportTimer,
}

impl SessionState {
    fn new(ssrc_out: u32, last_sent_sequence: u16, report_interval: Duration) -> Self {
        Self {
            phase: SessionPhase::Open,
            epoch: Instant::now(),
            ssrc_out,
            last_sent_sequence,
            last_sent_timestamp: 0,
            last_sent_at: None,
            timestamp_offset: None,
            packets_sent: 0,
            octets_sent: 0,
            tx_window: IntervalWindow::default(),
            ssrc_in: None,
            ssrc_changes: 0,
            receiving: false,
            expected_sequence: 0,
            highest_sequence: 0,
            sequence_cycles: 0,
            consecutive_out_of_order: 0,
            missing: 0,
            tracked: 0,
            last_payload_type: None,
            last_received_at: None,
            last_transit: None,
            jitter_level: 0,
            max_jitter_level: 0,
            packets_received: 0,
            octets_received: 0,
            packets_lost: 0,
            lost_since_last_rr: 0,
            last_rr_sequence: 0,
            packets_out_of_order: 0,
            packets_duplicated: 0,
            packets_too_late: 0,
            packets_rejected: 0,
            packets_malformed: 0,
            resynchronizations: 0,
            rx_window: IntervalWindow::default(),
            last_sr_ntp_middle: 0,
            last_sr_received_at: None,
            round_trip_ms: None,
            remote_canonical_name: None,
            bye_sent: false,
            timer: ReportTimer::new(report_interval),
        }
    }

    /// Forget everything about the incoming stream, e.g. after an SSRC change
    fn restart_reception(&mut self) {
        self.receiving = false;
        self.consecutive_out_of_order = 0;
        self.missing = 0;
        self.tracked = 0;
        self.last_transit = None;
        self.last_payload_type = None;
        self.sequence_cycles = 0;
    }

    pub(crate) fn extended_highest_sequence(&self) -> u32 {
        (self.sequence_cycles << 16) | self.highest_sequence as u32
    }

    pub(crate) fn jitter(&self) -> u32 {
        self.jitter_level >> JITTER_GUARD_BITS
    }

    fn snapshot(&self) -> SessionStatistics {
        SessionStatistics {
            packets_sent: self.packets_sent,
            octets_sent: self.octets_sent,
            packets_received: self.packets_received,
            octets_received: self.octets_received,
            packets_lost: self.packets_lost,
            packets_out_of_order: self.packets_out_of_order,
            packets_duplicated: self.packets_duplicated,
            packets_too_late: self.packets_too_late,
            packets_rejected: self.packets_rejected,
            packets_malformed: self.packets_malformed,
            resynchronizations: self.resynchronizations,
            ssrc_changes: self.ssrc_changes,
            average_send_time_ms: self.tx_window.average_ms,
            minimum_send_time_ms: self.tx_window.minimum_ms,
            maximum_send_time_ms: self.tx_window.maximum_ms,
            average_receive_time_ms: self.rx_window.average_ms,
            minimum_receive_time_ms: self.rx_window.minimum_ms,
            maximum_receive_time_ms: self.rx_window.maximum_ms,
            jitter: self.jitter(),
            maximum_jitter: self.max_jitter_level >> JITTER_GUARD_BITS,
            round_trip_ms: self.round_trip_ms,
        }
    }

    /// Move the highest sequence forward past `lost` missing packets
    fn slide_window(&mut self, lost: u64) {
        let shift = lost + 1;
        self.missing = if shift >= MISSING_WINDOW as u64 {
            0
        } else {
            self.missing << shift
        };
        self.missing |= if lost >= MISSING_WINDOW as u64 {
            u64::MAX
        } else {
            (1u64 << lost) - 1
        };
        self.tracked = (self.tracked as u64 + shift).min(MISSING_WINDOW as u64) as u32;
    }

    /// Classify a packet at or behind the highest sequence
    fn late_arrival(&mut self, sequence: u16) -> LateArrival {
        let distance = self.highest_sequence.wrapping_sub(sequence) as u32;
        if distance == 0 {
            return LateArrival::Duplicate;
        }
        if distance > self.tracked {
            return LateArrival::Unknown;
        }
        let bit = 1u64 << (distance - 1);
        if self.missing & bit == 0 {
            return LateArrival::Duplicate;
        }
        self.missing &= !bit;
        LateArrival::FilledGap
    }

    /// RFC 3550 §A.8 interarrival jitter, `jitter_level` is 16x the estimate
    fn update_jitter(&mut self, transit: i32) {
        if let Some(last) = self.last_transit {
            let d = transit.wrapping_sub(last).unsigned_abs() as i64;
            let level = self.jitter_level as i64;
            let level = level + d - ((level + 8) >> JITTER_GUARD_BITS);
            self.jitter_level = level.clamp(0, u32::MAX as i64) as u32;
            self.max_jitter_level = self.max_jitter_level.max(self.jitter_level);
        }
        self.last_transit = Some(transit);
    }
}

/// Canonical and tool names sent in SDES
#[derive(Debug, Clone)]
pub struct SessionNames {
    pub canonical_name: String,
    pub tool_name: String,
}

/// RTP Session
///
/// Stamps outgoing packets, tracks incoming ones and builds the RTCP
/// reports describing both directions.
pub struct RtpSession {
    id: SessionId,
    config: SessionConfig,
    state: Mutex<SessionState>,
    names: Mutex<SessionNames>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl RtpSession {
    /// Create a new RTP session with a random SSRC and initial sequence
    pub fn new(config: SessionConfig) -> Self {
        let ssrc = loop {
            let ssrc: u32 = rand::random();
            if ssrc != 0 {
                break ssrc;
            }
        };
        Self::with_ssrc(config, ssrc)
    }

    /// Create with specific SSRC
    pub fn with_ssrc(config: SessionConfig, ssrc: u32) -> Self {
        let id = SessionId::new();
        let canonical_name = if config.canonical_name.is_empty() {
            format!("{}@rtp-session", id)
        } else {
            config.canonical_name.clone()
        };
        let names = SessionNames {
            canonical_name,
            tool_name: config.tool_name.clone(),
        };
        let state = SessionState::new(ssrc, rand::random(), config.report_interval());

        Self {
            id,
            config,
            state: Mutex::new(state),
            names: Mutex::new(names),
            events: None,
        }
    }

    /// Deliver statistics and failure events to the owning layer
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the sequence number of the most recently sent packet
    pub fn with_last_sent_sequence(self, sequence: u16) -> Self {
        self.lock_state().last_sent_sequence = sequence;
        self
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_names(&self) -> MutexGuard<'_, SessionNames> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, kind: SessionEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::new(self.id, kind));
        }
    }

    fn activate(&self, state: &mut SessionState) {
        if state.phase == SessionPhase::Open {
            state.phase = SessionPhase::Active;
            self.emit(SessionEventKind::PhaseChanged {
                from: SessionPhase::Open,
                to: SessionPhase::Active,
            });
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get SSRC
    pub fn ssrc(&self) -> u32 {
        self.lock_state().ssrc_out
    }

    /// SSRC learned from the remote, if any packet arrived yet
    pub fn remote_ssrc(&self) -> Option<u32> {
        self.lock_state().ssrc_in
    }

    pub fn remote_canonical_name(&self) -> Option<String> {
        self.lock_state().remote_canonical_name.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock_state().phase
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.lock_state().snapshot()
    }

    pub fn names(&self) -> SessionNames {
        self.lock_names().clone()
    }

    pub fn set_canonical_name(&self, name: impl Into<String>) {
        self.lock_names().canonical_name = name.into();
    }

    pub fn set_tool_name(&self, name: impl Into<String>) {
        self.lock_names().tool_name = name.into();
    }

    fn media_ticks(&self, elapsed: Duration) -> u32 {
        (elapsed.as_micros() * self.config.clock_rate as u128 / 1_000_000) as u32
    }

    /// Stamp an outgoing packet with sequence number, SSRC and a continuous
    /// timestamp, and account for it in the send statistics.
    pub fn on_send(&self, packet: &mut RtpPacket) -> Result<()> {
        let now = Instant::now();
        let mut state = self.lock_state();

        if matches!(state.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return Err(RtpSessionError::Closed);
        }

        state.last_sent_sequence = state.last_sent_sequence.wrapping_add(1);
        packet.sequence = state.last_sent_sequence;
        packet.ssrc = state.ssrc_out;

        let offset = match state.timestamp_offset {
            Some(offset) => offset,
            None => {
                // Continue from the previous logical session if there was one
                let base = match state.last_sent_at {
                    Some(at) => state
                        .last_sent_timestamp
                        .wrapping_add(self.media_ticks(now.duration_since(at))),
                    None => rand::random(),
                };
                let offset = base.wrapping_sub(packet.timestamp);
                state.timestamp_offset = Some(offset);
                offset
            }
        };
        packet.timestamp = packet.timestamp.wrapping_add(offset);

        if let Some(previous) = state.last_sent_at {
            let talk_burst_start = self.config.media == MediaKind::Audio && packet.marker;
            if !talk_burst_start && state.packets_sent > 0 {
                state.tx_window.record(now.duration_since(previous));
            }
        }
        state.last_sent_at = Some(now);
        state.last_sent_timestamp = packet.timestamp;
        state.packets_sent += 1;
        state.octets_sent += packet.payload.len() as u64;
        state.tx_window.count_packet();
        metrics::record_packet_sent(packet.payload.len());

        self.activate(&mut state);
        state.timer.touch(now);

        if state.tx_window.flush_if_full(self.config.tx_statistics_window) {
            metrics::record_send_interval(Duration::from_millis(state.tx_window.average_ms as u64));
            self.emit(SessionEventKind::Statistics {
                direction: Direction::Send,
                statistics: state.snapshot(),
            });
        }

        debug!("Stamped {}", packet);
        Ok(())
    }

    /// Account for a received packet and decide whether it goes on to the
    /// jitter buffer.
    pub fn on_receive(&self, packet: &RtpPacket, arrival: Instant) -> ReceiveOutcome {
        let mut state = self.lock_state();
        let outcome = self.receive_locked(&mut state, packet, arrival);
        if let ReceiveOutcome::Discard(reason) = outcome {
            metrics::record_discard(reason.as_str());
        }
        outcome
    }

    fn receive_locked(
        &self,
        state: &mut SessionState,
        packet: &RtpPacket,
        arrival: Instant,
    ) -> ReceiveOutcome {
        if state.phase == SessionPhase::Closed {
            return ReceiveOutcome::Discard(DiscardReason::Closed);
        }

        if packet.version != 2 {
            state.packets_malformed += 1;
            return ReceiveOutcome::Discard(DiscardReason::BadVersion);
        }

        match state.ssrc_in {
            None => {
                state.ssrc_in = Some(packet.ssrc);
                info!("Session {} learned remote SSRC {:08x}", self.id, packet.ssrc);
            }
            Some(current) if current != packet.ssrc => {
                // One substitution is tolerated for NAT re-binding
                if self.config.allow_ssrc_change || state.ssrc_changes == 0 {
                    warn!(
                        "Session {} remote SSRC changed {:08x} -> {:08x}",
                        self.id, current, packet.ssrc
                    );
                    state.ssrc_changes += 1;
                    state.ssrc_in = Some(packet.ssrc);
                    state.restart_reception();
                    self.emit(SessionEventKind::SsrcChanged {
                        old: current,
                        new: packet.ssrc,
                    });
                } else {
                    state.packets_rejected += 1;
                    let error = RtpSessionError::UnexpectedSsrc(packet.ssrc);
                    debug!("Session {} dropping packet: {}", self.id, error);
                    return ReceiveOutcome::Discard(DiscardReason::UnexpectedSsrc);
                }
            }
            Some(_) => {}
        }

        if let Some(previous) = state.last_payload_type {
            if previous != packet.payload_type {
                if !self.config.ignore_payload_type_changes {
                    state.packets_rejected += 1;
                    return ReceiveOutcome::Discard(DiscardReason::PayloadTypeChanged);
                }
                debug!(
                    "Session {} payload type changed {} -> {}",
                    self.id, previous, packet.payload_type
                );
            }
        }
        state.last_payload_type = Some(packet.payload_type);

        let transit = self
            .media_ticks(arrival.saturating_duration_since(state.epoch))
            .wrapping_sub(packet.timestamp) as i32;

        if !state.receiving {
            state.receiving = true;
            state.expected_sequence = packet.sequence.wrapping_add(1);
            state.highest_sequence = packet.sequence;
            state.last_rr_sequence = packet.sequence;
            state.missing = 0;
            state.tracked = 0;
            state.last_transit = Some(transit);
        } else {
            let delta = packet.sequence.wrapping_sub(state.expected_sequence) as i16;

            if delta == 0 {
                state.consecutive_out_of_order = 0;
                state.slide_window(0);
                self.advance_to(state, packet.sequence);
                state.update_jitter(transit);
            } else if delta < 0 {
                state.consecutive_out_of_order += 1;
                if state.consecutive_out_of_order >= self.config.resync_threshold.max(1) {
                    // Sender renumbered its stream; follow it
                    let anomaly = RtpSessionError::SequenceAnomaly(format!(
                        "expected {}, got {} {} times in a row",
                        state.expected_sequence,
                        packet.sequence,
                        state.consecutive_out_of_order
                    ));
                    warn!("Session {} resynchronizing: {}", self.id, anomaly);
                    state.consecutive_out_of_order = 0;
                    state.resynchronizations += 1;
                    state.expected_sequence = packet.sequence.wrapping_add(1);
                    state.highest_sequence = packet.sequence;
                    state.last_rr_sequence = packet.sequence;
                    state.missing = 0;
                    state.tracked = 0;
                    state.last_transit = Some(transit);
                } else {
                    match state.late_arrival(packet.sequence) {
                        LateArrival::FilledGap => {
                            // Arrived late but arrived: it no longer counts as lost
                            state.packets_lost = state.packets_lost.saturating_sub(1);
                            state.lost_since_last_rr = state.lost_since_last_rr.saturating_sub(1);
                            state.packets_out_of_order += 1;
                        }
                        LateArrival::Duplicate => {
                            state.packets_duplicated += 1;
                            return ReceiveOutcome::Discard(DiscardReason::Duplicate);
                        }
                        LateArrival::Unknown => state.packets_out_of_order += 1,
                    }
                    if self.config.ignore_out_of_order {
                        return ReceiveOutcome::Discard(DiscardReason::OutOfOrder);
                    }
                }
            } else {
                let lost = delta as u64;
                state.packets_lost += lost;
                state.lost_since_last_rr += lost;
                state.consecutive_out_of_order = 0;
                metrics::record_packets_lost(lost);
                state.slide_window(lost);
                debug!(
                    "Session {} lost {} packets before sequence {}",
                    self.id, lost, packet.sequence
                );
                self.advance_to(state, packet.sequence);
                state.last_transit = Some(transit);
            }
        }

        if let Some(previous) = state.last_received_at {
            let talk_burst_start = self.config.media == MediaKind::Audio && packet.marker;
            if !talk_burst_start {
                state.rx_window.record(arrival.saturating_duration_since(previous));
            }
        }
        state.last_received_at = Some(arrival);
        state.packets_received += 1;
        state.octets_received += packet.payload.len() as u64;
        state.rx_window.count_packet();
        metrics::record_packet_received(packet.payload.len());

        self.activate(state);
        state.timer.touch(arrival);

        if state.rx_window.flush_if_full(self.config.rx_statistics_window) {
            metrics::update_jitter(state.jitter());
            self.emit(SessionEventKind::Statistics {
                direction: Direction::Receive,
                statistics: state.snapshot(),
            });
        }

        ReceiveOutcome::Deliver
    }

    fn advance_to(&self, state: &mut SessionState, sequence: u16) {
        if sequence < state.highest_sequence {
            state.sequence_cycles += 1;
        }
        state.highest_sequence = sequence;
        state.expected_sequence = sequence.wrapping_add(1);
    }

    /// A datagram on the data channel could not be decoded
    pub fn record_malformed(&self) {
        self.lock_state().packets_malformed += 1;
        metrics::record_discard(DiscardReason::BadVersion.as_str());
    }

    /// A datagram was dropped by policy before reaching the session
    pub fn record_rejected(&self) {
        self.lock_state().packets_rejected += 1;
    }

    /// Packets the jitter buffer received too late to play out
    pub fn record_too_late(&self, count: u64) {
        self.lock_state().packets_too_late += count;
    }

    /// Build the reception report block for the current remote source
    pub fn receiver_report(&self) -> Option<ReceptionReport> {
        let mut state = self.lock_state();
        report::build_reception_report(&mut state, Instant::now())
    }

    /// Time the read loop may block before the report timer needs attention
    pub fn next_report_in(&self, now: Instant) -> Duration {
        let state = self.lock_state();
        if matches!(state.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return state.timer.base();
        }
        state.timer.remaining(now)
    }

    /// Periodic report if the timer is due.
    ///
    /// Returns the compound packet and leaves the timer pending until
    /// [`RtpSession::report_sent`] is called.
    pub fn periodic_report(&self, now: Instant) -> Option<Bytes> {
        let mut state = self.lock_state();
        if matches!(state.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return None;
        }
        if !state.timer.poll(now) {
            return None;
        }
        let names = self.names();
        Some(RtcpCompound::encode(&report::build_periodic_report(&mut state, &names, now)))
    }

    /// Report on explicit request, unless one is already pending
    pub fn force_report(&self, now: Instant) -> Option<Bytes> {
        let mut state = self.lock_state();
        if matches!(state.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return None;
        }
        if !state.timer.claim() {
            debug!("Session {} report already pending", self.id);
            return None;
        }
        let names = self.names();
        Some(RtcpCompound::encode(&report::build_periodic_report(&mut state, &names, now)))
    }

    /// The pending report was written; the next traffic re-arms the timer
    pub fn report_sent(&self) {
        self.lock_state().timer.complete();
        metrics::record_report_sent();
    }

    /// The pending report had nowhere to go; release the timer anyway
    pub fn report_skipped(&self) {
        self.lock_state().timer.complete();
    }

    /// Parse an incoming control packet and apply it to the session.
    ///
    /// Returns the number of sub-packets acted on.
    pub fn handle_control(&self, data: &[u8]) -> usize {
        let mut handler = SessionControl {
            session: self,
            now: Instant::now(),
        };
        report::parse_control_packet(data, &mut handler).dispatched
    }

    /// Tear the session down.
    ///
    /// The first call returns the control packets to send: a bare receiver
    /// report if nothing was ever sent, then a report with the Goodbye.
    /// Subsequent calls return nothing.
    pub fn close(&self, reason: &str) -> Vec<Bytes> {
        let now = Instant::now();
        let mut state = self.lock_state();
        if state.bye_sent {
            return Vec::new();
        }
        state.bye_sent = true;

        let names = self.names();
        let mut packets = Vec::with_capacity(2);
        if state.packets_sent == 0 {
            packets.push(RtcpCompound::encode(&[report::build_receiver_only(&mut state, now)]));
        }

        let mut bye = report::build_periodic_report(&mut state, &names, now);
        bye.push(RtcpPacket::Goodbye(
            Goodbye::new(state.ssrc_out).with_reason(reason),
        ));
        packets.push(RtcpCompound::encode(&bye));

        let from = state.phase;
        state.phase = SessionPhase::Closing;
        state.timer.disarm();
        drop(state);

        info!("Session {} closing: {}", self.id, reason);
        self.emit(SessionEventKind::PhaseChanged {
            from,
            to: SessionPhase::Closing,
        });
        packets
    }

    /// The transport stopped reading
    pub fn mark_closed(&self) {
        let mut state = self.lock_state();
        let from = state.phase;
        if from == SessionPhase::Closed {
            return;
        }
        state.phase = SessionPhase::Closed;
        state.timer.disarm();
        drop(state);
        self.emit(SessionEventKind::PhaseChanged {
            from,
            to: SessionPhase::Closed,
        });
    }

    /// Start a new logical session on the same sockets.
    ///
    /// Statistics and incoming stream state are cleared; the outgoing SSRC and
    /// sequence counter continue, and the timestamp offset is re-established
    /// on the next send so timestamps stay continuous.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        let mut fresh = SessionState::new(
            state.ssrc_out,
            state.last_sent_sequence,
            self.config.report_interval(),
        );
        fresh.last_sent_timestamp = state.last_sent_timestamp;
        fresh.last_sent_at = state.last_sent_at;
        fresh.bye_sent = state.bye_sent;
        if matches!(state.phase, SessionPhase::Closing | SessionPhase::Closed) {
            fresh.phase = state.phase;
        }
        *state = fresh;
        debug!("Session {} statistics reset", self.id);
    }
}

/// Applies incoming control sub-packets to the session
struct SessionControl<'a> {
    session: &'a RtpSession,
    now: Instant,
}

impl SessionControl<'_> {
    fn apply_report_blocks(&self, state: &mut SessionState, reports: &[ReceptionReport]) {
        for block in reports.iter().filter(|b| b.ssrc == state.ssrc_out && b.lsr != 0) {
            // All three values are in 1/65536 s
            let now = ntp_middle32(ntp_now());
            let rtt = now.wrapping_sub(block.lsr).wrapping_sub(block.dlsr);
            if rtt < 0x8000_0000 {
                state.round_trip_ms = Some(((rtt as u64 * 1000) >> 16) as u32);
            }
        }
    }
}

impl ControlHandler for SessionControl<'_> {
    fn on_sender_report(&mut self, report: &SenderReport) {
        let mut state = self.session.lock_state();
        state.last_sr_ntp_middle = ntp_middle32(report.ntp_timestamp);
        state.last_sr_received_at = Some(self.now);
        self.apply_report_blocks(&mut state, &report.reports);
        debug!(
            "SR from {:08x}: {} packets, {} octets",
            report.ssrc, report.packet_count, report.octet_count
        );
    }

    fn on_receiver_report(&mut self, ssrc: u32, reports: &[ReceptionReport]) {
        let mut state = self.session.lock_state();
        self.apply_report_blocks(&mut state, reports);
        debug!("RR from {:08x} with {} blocks", ssrc, reports.len());
    }

    fn on_source_description(&mut self, sdes: &SourceDescription) {
        let mut state = self.session.lock_state();
        let remote = state.ssrc_in;
        for chunk in &sdes.chunks {
            if remote.map_or(true, |ssrc| ssrc == chunk.ssrc) {
                if let Some(cname) = chunk.item(SdesItemType::Cname) {
                    state.remote_canonical_name = Some(cname.to_string());
                }
            }
        }
    }

    fn on_goodbye(&mut self, bye: &Goodbye) {
        let mut state = self.session.lock_state();
        let remote = state.ssrc_in;
        for ssrc in bye.ssrcs.iter().filter(|s| remote.map_or(true, |r| r == **s)) {
            info!("Goodbye from {:08x}: {:?}", ssrc, bye.reason);
            self.session.emit(SessionEventKind::GoodbyeReceived {
                ssrc: *ssrc,
                reason: bye.reason.clone(),
            });
            if self.session.config.close_on_bye && state.phase != SessionPhase::Closed {
                let from = state.phase;
                state.phase = SessionPhase::Closing;
                self.session.emit(SessionEventKind::PhaseChanged {
                    from,
                    to: SessionPhase::Closing,
                });
            }
        }
    }

    fn on_application(&mut self, app: &ApplicationDefined) {
        debug!(
            "APP {:?}/{} from {:08x}, {} bytes",
            String::from_utf8_lossy(&app.name),
            app.subtype,
            app.ssrc,
            app.data.len()
        );
    }

    fn on_intra_frame_request(&mut self, fir: &IntraFrameRequest) {
        self.session
            .emit(SessionEventKind::IntraFrameRequest { ssrc: fir.ssrc });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::rtp::rtcp::ReceiverReport;

    fn session_with(ignore_out_of_order: bool) -> RtpSession {
        let config = SessionConfig {
            ignore_out_of_order,
            ..Default::default()
        };
        RtpSession::with_ssrc(config, 0x1234)
    }

    fn packet(sequence: u16, timestamp: u32) -> RtpPacket {
        RtpPacket::new(0, sequence, timestamp, 0xAAAA, Bytes::from_static(&[0; 160]))
    }

    fn receive_all(session: &RtpSession, sequences: &[u16]) -> Vec<ReceiveOutcome> {
        let start = Instant::now();
        sequences
            .iter()
            .enumerate()
            .map(|(i, seq)| {
                let arrival = start + Duration::from_millis(20 * i as u64);
                session.on_receive(&packet(*seq, *seq as u32 * 160), arrival)
            })
            .collect()
    }

    #[test]
    fn test_sequence_wraps() {
        let session = RtpSession::with_ssrc(SessionConfig::default(), 1).with_last_sent_sequence(65535);
        let mut p = packet(0, 0);
        session.on_send(&mut p).unwrap();
        assert_eq!(p.sequence, 0);
        assert_eq!(p.ssrc, 1);

        session.on_send(&mut p).unwrap();
        assert_eq!(p.sequence, 1);
    }

    #[test]
    fn test_timestamp_offset_kept() {
        let session = RtpSession::with_ssrc(SessionConfig::default(), 1);
        let mut first = packet(0, 0);
        let mut second = packet(0, 160);
        session.on_send(&mut first).unwrap();
        session.on_send(&mut second).unwrap();
        assert_eq!(second.timestamp.wrapping_sub(first.timestamp), 160);
    }

    #[test]
    fn test_timestamp_continues_after_reset() {
        let session = RtpSession::with_ssrc(SessionConfig::default(), 1);
        let mut first = packet(0, 5000);
        session.on_send(&mut first).unwrap();

        session.reset();
        let mut resumed = packet(0, 0);
        session.on_send(&mut resumed).unwrap();

        // Continues from the last timestamp, advanced by wall clock only
        let advance = resumed.timestamp.wrapping_sub(first.timestamp);
        assert!(advance < 8000, "advance {}", advance);
        assert_eq!(resumed.sequence, first.sequence.wrapping_add(1));
        assert_eq!(session.statistics().packets_sent, 1);
    }

    #[test]
    fn test_single_gap_counts_one_lost() {
        let session = session_with(true);
        let outcomes = receive_all(&session, &[1, 2, 4, 5]);
        assert!(outcomes.iter().all(|o| *o == ReceiveOutcome::Deliver));

        let stats = session.statistics();
        assert_eq!(stats.packets_lost, 1);
        assert_eq!(stats.packets_out_of_order, 0);
        assert_eq!(stats.packets_received, 4);
    }

    #[test]
    fn test_out_of_order_not_counted_lost() {
        let session = session_with(false);
        let outcomes = receive_all(&session, &[1, 3, 2, 4]);
        assert!(outcomes.iter().all(|o| *o == ReceiveOutcome::Deliver));

        let stats = session.statistics();
        assert_eq!(stats.packets_out_of_order, 1);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn test_out_of_order_ignored() {
        let session = session_with(true);
        let outcomes = receive_all(&session, &[1, 3, 2, 4]);
        assert_eq!(outcomes[2], ReceiveOutcome::Discard(DiscardReason::OutOfOrder));

        // Dropped by policy, but it did arrive
        let stats = session.statistics();
        assert_eq!(stats.packets_out_of_order, 1);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn test_duplicate_keeps_loss() {
        for ignore in [false, true] {
            let session = session_with(ignore);
            let outcomes = receive_all(&session, &[1, 2, 4, 5, 1, 5]);
            assert_eq!(outcomes[4], ReceiveOutcome::Discard(DiscardReason::Duplicate));
            assert_eq!(outcomes[5], ReceiveOutcome::Discard(DiscardReason::Duplicate));

            let stats = session.statistics();
            assert_eq!(stats.packets_lost, 1, "ignore_out_of_order = {}", ignore);
            assert_eq!(stats.packets_duplicated, 2);
            assert_eq!(stats.packets_out_of_order, 0);
            assert_eq!(stats.packets_received, 4);
        }
    }

    #[test]
    fn test_gap_filled_once() {
        let session = session_with(false);
        let outcomes = receive_all(&session, &[1, 4, 2, 2, 3, 5]);
        assert_eq!(outcomes[2], ReceiveOutcome::Deliver);
        assert_eq!(outcomes[3], ReceiveOutcome::Discard(DiscardReason::Duplicate));
        assert_eq!(outcomes[4], ReceiveOutcome::Deliver);

        let stats = session.statistics();
        assert_eq!(stats.packets_lost, 0);
        assert_eq!(stats.packets_out_of_order, 2);
        assert_eq!(stats.packets_duplicated, 1);
    }

    #[test]
    fn test_packet_before_first_is_not_duplicate() {
        let session = session_with(false);
        let outcomes = receive_all(&session, &[10, 11, 9]);
        assert_eq!(outcomes[2], ReceiveOutcome::Deliver);
        let stats = session.statistics();
        assert_eq!(stats.packets_out_of_order, 1);
        assert_eq!(stats.packets_duplicated, 0);
    }

    #[test]
    fn test_backward_jumps_resync_once() {
        let session = session_with(false);
        let mut sequences: Vec<u16> = (1000..1010).collect();
        // Vendor renumbers the stream from 100
        sequences.extend(100..130);
        receive_all(&session, &sequences);

        let stats = session.statistics();
        assert_eq!(stats.resynchronizations, 1);
        assert_eq!(stats.packets_out_of_order, 9);
        assert_eq!(session.lock_state().expected_sequence, 130);
    }

    #[test]
    fn test_resync_with_ignore_enabled() {
        let session = session_with(true);
        let mut sequences: Vec<u16> = (1000..1010).collect();
        sequences.extend(100..115);
        let outcomes = receive_all(&session, &sequences);

        // Nine dropped, the tenth resynchronizes and is delivered
        assert_eq!(outcomes[10..19].iter().filter(|o| **o != ReceiveOutcome::Deliver).count(), 9);
        assert_eq!(outcomes[19], ReceiveOutcome::Deliver);
        assert_eq!(session.statistics().resynchronizations, 1);
        assert!(outcomes[20..].iter().all(|o| *o == ReceiveOutcome::Deliver));
    }

    #[test]
    fn test_ssrc_change_tolerated_once() {
        let session = session_with(true);
        let start = Instant::now();
        let mut p = packet(1, 0);
        assert_eq!(session.on_receive(&p, start), ReceiveOutcome::Deliver);

        p.ssrc = 0xBBBB;
        p.sequence = 500;
        assert_eq!(session.on_receive(&p, start), ReceiveOutcome::Deliver);
        assert_eq!(session.remote_ssrc(), Some(0xBBBB));

        p.ssrc = 0xCCCC;
        assert_eq!(
            session.on_receive(&p, start),
            ReceiveOutcome::Discard(DiscardReason::UnexpectedSsrc)
        );
        let stats = session.statistics();
        assert_eq!(stats.ssrc_changes, 1);
        assert_eq!(stats.packets_rejected, 1);
        assert_eq!(stats.packets_lost, 0);
    }

    #[test]
    fn test_ssrc_change_unrestricted() {
        let config = SessionConfig {
            allow_ssrc_change: true,
            ..Default::default()
        };
        let session = RtpSession::with_ssrc(config, 1);
        let start = Instant::now();
        for ssrc in [1u32, 2, 3, 4] {
            let mut p = packet(10, 0);
            p.ssrc = ssrc;
            assert_eq!(session.on_receive(&p, start), ReceiveOutcome::Deliver);
        }
        assert_eq!(session.statistics().ssrc_changes, 3);
    }

    #[test]
    fn test_payload_type_change_policy() {
        let config = SessionConfig {
            ignore_payload_type_changes: false,
            ..Default::default()
        };
        let session = RtpSession::with_ssrc(config, 1);
        let start = Instant::now();
        session.on_receive(&packet(1, 0), start);

        let mut p = packet(2, 160);
        p.payload_type = 8;
        assert_eq!(
            session.on_receive(&p, start),
            ReceiveOutcome::Discard(DiscardReason::PayloadTypeChanged)
        );

        let tolerant = session_with(true);
        tolerant.on_receive(&packet(1, 0), start);
        assert_eq!(tolerant.on_receive(&p, start), ReceiveOutcome::Deliver);
    }

    #[test]
    fn test_bad_version_discarded() {
        let session = session_with(true);
        let mut p = packet(1, 0);
        p.version = 1;
        assert_eq!(
            session.on_receive(&p, Instant::now()),
            ReceiveOutcome::Discard(DiscardReason::BadVersion)
        );
        assert_eq!(session.statistics().packets_malformed, 1);
        assert_eq!(session.remote_ssrc(), None);
    }

    #[test]
    fn test_jitter_zero_for_perfect_spacing() {
        let session = session_with(true);
        // 20 ms spacing matches 160 samples at 8 kHz
        receive_all(&session, &(1..50).collect::<Vec<_>>());
        assert_eq!(session.statistics().jitter, 0);
    }

    #[test]
    fn test_jitter_grows_with_variation() {
        let session = session_with(true);
        let start = Instant::now();
        for i in 0..50u16 {
            let wobble = if i % 2 == 0 { 0 } else { 10 };
            let arrival = start + Duration::from_millis(20 * i as u64 + wobble);
            session.on_receive(&packet(i, i as u32 * 160), arrival);
        }
        let stats = session.statistics();
        assert!(stats.jitter > 0);
        assert!(stats.maximum_jitter >= stats.jitter);
    }

    #[test]
    fn test_statistics_window_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            rx_statistics_window: 10,
            ..Default::default()
        };
        let session = RtpSession::with_ssrc(config, 1).with_events(tx);
        receive_all(&session, &(1..=25).collect::<Vec<_>>());

        let mut windows = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEventKind::Statistics { direction, statistics } = event.kind {
                assert_eq!(direction, Direction::Receive);
                assert_eq!(statistics.average_receive_time_ms, 20);
                windows += 1;
            }
        }
        assert_eq!(windows, 2);
    }

    #[test]
    fn test_send_window_skips_talk_burst_start() {
        let session = session_with(true);
        for (i, marker) in [false, true, false].into_iter().enumerate() {
            let mut p = packet(0, i as u32 * 160);
            p.set_marker(marker);
            session.on_send(&mut p).unwrap();
        }
        // Only the third packet measured an interval
        assert_eq!(session.lock_state().tx_window.samples, 1);
        assert_eq!(session.statistics().packets_sent, 3);
    }

    #[test]
    fn test_send_window_event() {
        let config = SessionConfig {
            tx_statistics_window: 3,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = RtpSession::with_ssrc(config, 1).with_events(tx);

        for i in 0..3 {
            session.on_send(&mut packet(0, i * 160)).unwrap();
        }
        let event = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|e| matches!(e.kind, SessionEventKind::Statistics { .. }))
            .expect("statistics event");
        assert_eq!(
            event.kind,
            SessionEventKind::Statistics {
                direction: Direction::Send,
                statistics: session.statistics(),
            }
        );
    }

    #[test]
    fn test_close_without_sending() {
        let session = session_with(true);
        let packets = session.close("hangup");
        assert_eq!(packets.len(), 2);

        let first = RtcpCompound::decode(&packets[0]).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].packet_type, 201);
        assert_eq!(first[0].count, 0);

        let second = RtcpCompound::decode(&packets[1]).unwrap();
        let byes: Vec<_> = second.iter().filter(|p| p.packet_type == 203).collect();
        assert_eq!(byes.len(), 1);
        match RtcpPacket::from_raw(byes[0]).unwrap() {
            RtcpPacket::Goodbye(bye) => assert_eq!(bye.reason.as_deref(), Some("hangup")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(session.close("again").is_empty());
        assert_eq!(session.phase(), SessionPhase::Closing);
    }

    #[test]
    fn test_close_after_sending_uses_sender_report() {
        let session = session_with(true);
        session.on_send(&mut packet(0, 0)).unwrap();
        let packets = session.close("done");
        assert_eq!(packets.len(), 1);
        let raw = RtcpCompound::decode(&packets[0]).unwrap();
        assert_eq!(raw[0].packet_type, 200);
        assert!(matches!(
            session.on_send(&mut packet(0, 0)),
            Err(RtpSessionError::Closed)
        ));
    }

    #[test]
    fn test_force_report_suppressed_while_pending() {
        let session = session_with(true);
        let now = Instant::now();
        assert!(session.force_report(now).is_some());
        assert!(session.force_report(now).is_none());
        assert!(session.periodic_report(now + Duration::from_secs(60)).is_none());

        session.report_sent();
        assert!(session.force_report(now).is_some());
    }

    #[test]
    fn test_periodic_report_due() {
        let config = SessionConfig {
            report_interval_ms: 3000,
            ..Default::default()
        };
        let session = RtpSession::with_ssrc(config, 1);
        let now = Instant::now();
        // Nothing arms the timer before traffic
        assert!(session.periodic_report(now + Duration::from_secs(60)).is_none());

        session.on_receive(&packet(1, 0), now);
        assert!(session.periodic_report(now).is_none());
        assert!(session.periodic_report(now + Duration::from_millis(1999)).is_none());
        assert!(session.periodic_report(now + Duration::from_secs(4)).is_some());
        // Not again until the previous one is marked sent
        assert!(session.periodic_report(now + Duration::from_secs(9)).is_none());
    }

    #[test]
    fn test_silent_session_reports_once() {
        let config = SessionConfig {
            report_interval_ms: 3000,
            ..Default::default()
        };
        let session = RtpSession::with_ssrc(config, 1);
        let start = Instant::now();
        session.on_receive(&packet(1, 0), start);

        let mut fired = 0;
        for step in 1..=10u64 {
            let now = start + Duration::from_secs(5 * step);
            if session.periodic_report(now).is_some() {
                fired += 1;
                session.report_sent();
            }
            assert!(session.next_report_in(now) <= Duration::from_secs(3));
        }
        assert_eq!(fired, 1);

        // Traffic arms it again
        let resumed = start + Duration::from_secs(60);
        session.on_receive(&packet(2, 160), resumed);
        assert!(session.periodic_report(resumed + Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_control_goodbye_and_fir_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            close_on_bye: true,
            ..Default::default()
        };
        let session = RtpSession::with_ssrc(config, 1).with_events(tx);
        session.on_receive(&packet(1, 0), Instant::now());

        let data = RtcpCompound::encode(&[
            RtcpPacket::ReceiverReport(ReceiverReport::new(0xAAAA)),
            RtcpPacket::IntraFrameRequest(IntraFrameRequest { ssrc: 1 }),
            RtcpPacket::Goodbye(Goodbye::new(0xAAAA).with_reason("bye")),
        ]);
        assert_eq!(session.handle_control(&data), 3);
        assert_eq!(session.phase(), SessionPhase::Closing);

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.kind).collect();
        assert!(kinds.contains(&SessionEventKind::IntraFrameRequest { ssrc: 1 }));
        assert!(kinds.contains(&SessionEventKind::GoodbyeReceived {
            ssrc: 0xAAAA,
            reason: Some("bye".into())
        }));
    }

    #[test]
    fn test_sender_report_sets_lsr() {
        let session = session_with(true);
        let sr = SenderReport::new(0xAAAA, 0, 10, 1600);
        let middle = ntp_middle32(sr.ntp_timestamp);
        session.handle_control(&RtcpPacket::SenderReport(sr).serialize());

        session.on_receive(&packet(1, 0), Instant::now());
        let block = session.receiver_report().unwrap();
        assert_eq!(block.lsr, middle);
    }

    #[test]
    fn test_names_update() {
        let session = session_with(true);
        session.set_canonical_name("carol@example.com");
        session.set_tool_name("softphone");
        let names = session.names();
        assert_eq!(names.canonical_name, "carol@example.com");
        assert_eq!(names.tool_name, "softphone");
    }
}
