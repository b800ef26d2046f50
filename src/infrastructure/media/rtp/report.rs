//! RTCP report building and parsing
//!
//! Turns session state into SR/RR/SDES sub-packets and dispatches incoming
//! compound packets to a [`ControlHandler`].

use super::rtcp::{
    ApplicationDefined, Goodbye, IntraFrameRequest, ReceiverReport, ReceptionReport, RtcpCompound,
    RtcpPacket, SdesChunk, SdesItemType, SenderReport, SourceDescription,
};
use super::session::{SessionNames, SessionState};
use std::time::Instant;
use tracing::{debug, warn};

/// Receiver of parsed control sub-packets; every callback is optional
pub trait ControlHandler {
    fn on_sender_report(&mut self, _report: &SenderReport) {}
    fn on_receiver_report(&mut self, _ssrc: u32, _reports: &[ReceptionReport]) {}
    fn on_source_description(&mut self, _sdes: &SourceDescription) {}
    fn on_goodbye(&mut self, _bye: &Goodbye) {}
    fn on_application(&mut self, _app: &ApplicationDefined) {}
    fn on_intra_frame_request(&mut self, _fir: &IntraFrameRequest) {}
}

/// What happened to the sub-packets of one compound packet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSummary {
    pub dispatched: usize,
    pub skipped: usize,
}

/// Reception report block for the learned remote source.
///
/// Returns `None` until a data packet was received. Resets the
/// per-interval loss counter.
pub(crate) fn build_reception_report(
    state: &mut SessionState,
    now: Instant,
) -> Option<ReceptionReport> {
    if !state.receiving {
        return None;
    }
    let ssrc = state.ssrc_in?;

    let expected_interval = state.expected_sequence.wrapping_sub(state.last_rr_sequence) as u64;
    let fraction_lost = if expected_interval == 0 {
        0
    } else {
        ((state.lost_since_last_rr << 8) / expected_interval).min(255) as u8
    };

    let (lsr, dlsr) = match state.last_sr_received_at {
        Some(at) => {
            let delay = now.saturating_duration_since(at);
            (state.last_sr_ntp_middle, (delay.as_secs_f64() * 65536.0) as u32)
        }
        None => (0, 0),
    };

    let report = ReceptionReport {
        ssrc,
        fraction_lost,
        cumulative_lost: (state.packets_lost + state.packets_too_late).min(0x00FF_FFFF) as u32,
        highest_seq: state.extended_highest_sequence(),
        jitter: state.jitter(),
        lsr,
        dlsr,
    };

    state.lost_since_last_rr = 0;
    state.last_rr_sequence = state.expected_sequence;

    Some(report)
}

/// Receiver report on its own; carries no block if nothing was received
pub(crate) fn build_receiver_only(state: &mut SessionState, now: Instant) -> RtcpPacket {
    let mut rr = ReceiverReport::new(state.ssrc_out);
    if let Some(block) = build_reception_report(state, now) {
        rr.add_report(block);
    }
    RtcpPacket::ReceiverReport(rr)
}

/// SR if anything was sent, otherwise RR, followed by SDES
pub(crate) fn build_periodic_report(
    state: &mut SessionState,
    names: &SessionNames,
    now: Instant,
) -> Vec<RtcpPacket> {
    let report = if state.packets_sent > 0 {
        let mut sr = SenderReport::new(
            state.ssrc_out,
            state.last_sent_timestamp,
            state.packets_sent as u32,
            state.octets_sent as u32,
        );
        if let Some(block) = build_reception_report(state, now) {
            sr.add_report(block);
        }
        RtcpPacket::SenderReport(sr)
    } else {
        build_receiver_only(state, now)
    };

    let mut sdes = SourceDescription::new();
    sdes.add_chunk(
        SdesChunk::new(state.ssrc_out)
            .with_item(SdesItemType::Cname, names.canonical_name.as_str())
            .with_item(SdesItemType::Tool, names.tool_name.as_str()),
    );

    vec![report, RtcpPacket::SourceDescription(sdes)]
}

/// Parse a compound control packet and dispatch its sub-packets.
///
/// Malformed sub-packets are logged and skipped; a framing error stops the
/// walk but everything before it is still dispatched.
pub fn parse_control_packet<H>(data: &[u8], handler: &mut H) -> ControlSummary
where
    H: ControlHandler + ?Sized,
{
    let mut summary = ControlSummary::default();

    for raw in RtcpCompound::iter(data) {
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Dropping rest of RTCP compound packet: {}", e);
                summary.skipped += 1;
                break;
            }
        };

        let packet = match RtcpPacket::from_raw(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Skipping RTCP sub-packet type {}: {}", raw.packet_type, e);
                summary.skipped += 1;
                continue;
            }
        };

        match &packet {
            RtcpPacket::SenderReport(sr) => handler.on_sender_report(sr),
            RtcpPacket::ReceiverReport(rr) => handler.on_receiver_report(rr.ssrc, &rr.reports),
            RtcpPacket::SourceDescription(sdes) => handler.on_source_description(sdes),
            RtcpPacket::Goodbye(bye) => handler.on_goodbye(bye),
            RtcpPacket::ApplicationDefined(app) => handler.on_application(app),
            RtcpPacket::IntraFrameRequest(fir) => handler.on_intra_frame_request(fir),
        }
        summary.dispatched += 1;
    }

    debug!(
        "RTCP compound: {} dispatched, {} skipped",
        summary.dispatched, summary.skipped
    );
    summary
}
