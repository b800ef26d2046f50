//! Media processing implementations

pub mod encoding;
pub mod metrics;
pub mod rtp;
pub mod transport;

pub use encoding::{
    EncodingRegistry, EncodingSlot, EncodingStrategy, PacketProtector, PlainEncoding,
    SecuredEncoding,
};
pub use rtp::{
    Goodbye, ReceiveOutcome, ReceiverReport, RtcpError, RtcpPacket, RtpError, RtpPacket,
    RtpSession, SenderReport, SourceDescription,
};
pub use transport::{MediaTransport, SocketPair};
