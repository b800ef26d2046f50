//! RTP Data Packet (RFC 3550 §5.1)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Highest number of contributing sources a header can carry
pub const MAX_CSRC: usize = 15;

/// RTP Packet Structure
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    /// RTP version (should be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// Marker bit
    pub marker: bool,
    /// Payload type
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
    /// Contributing source identifiers
    pub csrc: Vec<u32>,
    /// Extension header (if extension flag is set), data is a multiple of 4 bytes
    pub extension_profile: Option<u16>,
    pub extension_data: Option<Bytes>,
    /// Payload data
    pub payload: Bytes,
    /// Padding length (if padding flag is set)
    pub padding_len: u8,
}

/// Which path a datagram belongs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    Data,
    Control,
}

/// Sort a raw datagram into the data or control path.
///
/// RTCP packet types 192..=223 occupy the same byte as marker + payload
/// type 64..=95, so anything in that range goes to the control path.
pub fn classify(data: &[u8]) -> PacketClass {
    match data.get(1) {
        Some(byte1) if (192..=223).contains(byte1) => PacketClass::Control,
        _ => PacketClass::Data,
    }
}

impl RtpPacket {
    /// Minimum RTP header size (without CSRC, extension, or padding)
    pub const MIN_HEADER_SIZE: usize = 12;

    /// Create a new RTP packet
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension_profile: None,
            extension_data: None,
            payload,
            padding_len: 0,
        }
    }

    /// Parse RTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < Self::MIN_HEADER_SIZE {
            return Err(RtpError::Truncated);
        }

        let mut buf = data;

        // Byte 0: V(2), P(1), X(1), CC(4)
        let byte0 = buf.get_u8();
        let version = (byte0 >> 6) & 0x03;
        let padding = (byte0 & 0x20) != 0;
        let extension = (byte0 & 0x10) != 0;
        let csrc_count = (byte0 & 0x0F) as usize;

        if version != 2 {
            return Err(RtpError::BadVersion(version));
        }

        // Byte 1: M(1), PT(7)
        let byte1 = buf.get_u8();
        let marker = (byte1 & 0x80) != 0;
        let payload_type = byte1 & 0x7F;

        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(RtpError::Truncated);
        }
        let csrc = (0..csrc_count).map(|_| buf.get_u32()).collect();

        let (extension_profile, extension_data) = if extension {
            if buf.remaining() < 4 {
                return Err(RtpError::Truncated);
            }
            let profile = buf.get_u16();
            let length = buf.get_u16() as usize * 4;

            if buf.remaining() < length {
                return Err(RtpError::Truncated);
            }

            let ext_data = Bytes::copy_from_slice(&buf[..length]);
            buf.advance(length);

            (Some(profile), Some(ext_data))
        } else {
            (None, None)
        };

        let mut payload_len = buf.remaining();
        let mut padding_len = 0;

        if padding {
            if payload_len == 0 {
                return Err(RtpError::InvalidPadding);
            }
            padding_len = buf[payload_len - 1];
            if padding_len == 0 || padding_len as usize > payload_len {
                return Err(RtpError::InvalidPadding);
            }
            payload_len -= padding_len as usize;
        }

        let payload = Bytes::copy_from_slice(&buf[..payload_len]);

        Ok(Self {
            version,
            padding,
            extension,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            extension_profile,
            extension_data,
            payload,
            padding_len,
        })
    }

    fn written_extension(&self) -> Option<(u16, &Bytes)> {
        match (self.extension_profile, &self.extension_data) {
            (Some(profile), Some(data)) => Some((profile, data)),
            _ => None,
        }
    }

    fn written_padding(&self) -> u8 {
        if self.padding {
            self.padding_len
        } else {
            0
        }
    }

    /// Serialize RTP packet to bytes.
    ///
    /// The P and X bits follow what is actually written, not the flags.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.calculate_size());
        let extension = self.written_extension();
        let padding_len = self.written_padding();

        let byte0 = (self.version << 6)
            | (((padding_len > 0) as u8) << 5)
            | ((extension.is_some() as u8) << 4)
            | (self.csrc.len().min(MAX_CSRC) as u8);
        buf.put_u8(byte0);

        let byte1 = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf.put_u8(byte1);

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in self.csrc.iter().take(MAX_CSRC) {
            buf.put_u32(*csrc);
        }

        if let Some((profile, data)) = extension {
            buf.put_u16(profile);
            buf.put_u16((data.len() / 4) as u16);
            buf.put_slice(data);
        }

        buf.put_slice(&self.payload);

        if padding_len > 0 {
            buf.put_bytes(0, (padding_len - 1) as usize);
            buf.put_u8(padding_len);
        }

        buf.freeze()
    }

    /// Header size: 12 + 4 per CSRC + extension header and words
    pub fn header_size(&self) -> usize {
        let mut size = Self::MIN_HEADER_SIZE + self.csrc.len().min(MAX_CSRC) * 4;
        if let Some((_, data)) = self.written_extension() {
            size += 4 + data.len();
        }
        size
    }

    /// Calculate total packet size
    pub fn calculate_size(&self) -> usize {
        self.header_size() + self.payload.len() + self.written_padding() as usize
    }

    /// Set marker bit
    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
    }

    /// Add CSRC, ignored once the list holds 15 entries
    pub fn add_csrc(&mut self, csrc: u32) {
        if self.csrc.len() < MAX_CSRC {
            self.csrc.push(csrc);
        }
    }

    /// Set extension; data is zero-padded to a whole number of words
    pub fn set_extension(&mut self, profile: u16, data: Bytes) {
        let data = if data.len() % 4 == 0 {
            data
        } else {
            let mut padded = BytesMut::from(&data[..]);
            padded.put_bytes(0, 4 - data.len() % 4);
            padded.freeze()
        };
        self.extension = true;
        self.extension_profile = Some(profile);
        self.extension_data = Some(data);
    }

    /// Add padding
    pub fn add_padding(&mut self, target_size: usize) {
        let current_size = self.header_size() + self.payload.len();
        if target_size > current_size && target_size - current_size <= u8::MAX as usize {
            self.padding = true;
            self.padding_len = (target_size - current_size) as u8;
        }
    }
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP[PT={}, Seq={}, TS={}, SSRC={:08x}, Marker={}, Payload={}]",
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.marker,
            self.payload.len()
        )
    }
}

/// RTP errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtpError {
    #[error("Packet truncated")]
    Truncated,
    #[error("Bad version: {0}")]
    BadVersion(u8),
    #[error("Invalid padding")]
    InvalidPadding,
}
