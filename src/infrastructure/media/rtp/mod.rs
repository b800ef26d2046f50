//! RTP (Real-time Transport Protocol) Implementation
//!
//! This module implements RTP and RTCP according to RFC 3550.

pub mod packet;
pub mod report;
pub mod rtcp;
pub mod session;
pub mod timer;

pub use packet::{classify, PacketClass, RtpError, RtpPacket};
pub use report::{parse_control_packet, ControlHandler, ControlSummary};
pub use rtcp::{
    ApplicationDefined, Goodbye, IntraFrameRequest, RawSubPacket, ReceiverReport,
    ReceptionReport, RtcpCompound, RtcpError, RtcpPacket, RtcpPacketType, SdesChunk,
    SdesItemType, SenderReport, SourceDescription,
};
pub use session::{DiscardReason, ReceiveOutcome, RtpSession, SessionNames, JITTER_GUARD_BITS};
pub use timer::ReportTimer;
