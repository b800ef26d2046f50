//! RTCP (RTP Control Protocol) compound packets (RFC 3550 §6)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// NTP timestamp is seconds since 1900, Unix is since 1970
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Size of the common sub-packet header
pub const HEADER_SIZE: usize = 4;

/// Size of one reception report block
pub const REPORT_BLOCK_SIZE: usize = 24;

/// At most 31 report blocks fit the 5-bit count field
pub const MAX_REPORT_BLOCKS: usize = 31;

/// RTCP Packet Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Full Intra-frame Request (RFC 2032 vendor extension)
    FIR = 192,
    /// Sender Report
    SR = 200,
    /// Receiver Report
    RR = 201,
    /// Source Description
    SDES = 202,
    /// Goodbye
    BYE = 203,
    /// Application Defined
    APP = 204,
}

impl RtcpPacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            192 => Some(Self::FIR),
            200 => Some(Self::SR),
            201 => Some(Self::RR),
            202 => Some(Self::SDES),
            203 => Some(Self::BYE),
            204 => Some(Self::APP),
            _ => None,
        }
    }
}

/// Current wall clock as a 64-bit NTP timestamp
pub fn ntp_now() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ntp_from_unix(duration)
}

pub fn ntp_from_unix(duration: Duration) -> u64 {
    let seconds = duration.as_secs() + NTP_EPOCH_OFFSET;
    let fraction = ((duration.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Middle 32 bits of an NTP timestamp, as carried in LSR
pub fn ntp_middle32(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// One framed sub-packet of a compound packet, body not yet interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSubPacket {
    /// 5-bit count / subtype field
    pub count: u8,
    pub packet_type: u8,
    /// Body after the 4-byte header, padding removed
    pub body: Bytes,
}

/// Iterator over the sub-packets of a compound packet.
///
/// Stops after the first framing error.
pub struct SubPackets<'a> {
    data: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for SubPackets<'a> {
    type Item = Result<RawSubPacket, RtcpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        let result = self.read_next();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

impl<'a> SubPackets<'a> {
    fn read_next(&mut self) -> Result<RawSubPacket, RtcpError> {
        if self.data.len() < HEADER_SIZE {
            return Err(RtcpError::Truncated);
        }
        let byte0 = self.data[0];
        let version = byte0 >> 6;
        if version != 2 {
            return Err(RtcpError::BadVersion(version));
        }
        let padding = byte0 & 0x20 != 0;
        let count = byte0 & 0x1F;
        let packet_type = self.data[1];
        let length = u16::from_be_bytes([self.data[2], self.data[3]]) as usize;
        let total = (length + 1) * 4;

        if total > self.data.len() {
            return Err(RtcpError::Truncated);
        }

        let mut body = &self.data[HEADER_SIZE..total];
        if padding {
            let pad = body.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > body.len() {
                return Err(RtcpError::Malformed("invalid padding"));
            }
            body = &body[..body.len() - pad];
        }

        let raw = RawSubPacket {
            count,
            packet_type,
            body: Bytes::copy_from_slice(body),
        };
        self.data = &self.data[total..];
        Ok(raw)
    }
}

/// Compound packet framing
pub struct RtcpCompound;

impl RtcpCompound {
    /// Walk the sub-packets of a compound packet lazily
    pub fn iter(data: &[u8]) -> SubPackets<'_> {
        SubPackets {
            data,
            failed: false,
        }
    }

    /// Split a compound packet into its sub-packets.
    ///
    /// Fails if any declared length runs past the end of the buffer.
    pub fn decode(data: &[u8]) -> Result<Vec<RawSubPacket>, RtcpError> {
        if data.len() < HEADER_SIZE {
            return Err(RtcpError::Truncated);
        }
        Self::iter(data).collect()
    }

    /// Concatenate sub-packets into one compound packet
    pub fn encode(packets: &[RtcpPacket]) -> Bytes {
        let mut buf = BytesMut::with_capacity(packets.len() * 32);
        for packet in packets {
            packet.serialize_into(&mut buf);
        }
        buf.freeze()
    }
}

/// Writes the common header; `body_len` must be a multiple of 4
fn put_header(buf: &mut BytesMut, count: u8, packet_type: u8, body_len: usize) {
    debug_assert_eq!(body_len % 4, 0);
    buf.put_u8(0x80 | (count & 0x1F));
    buf.put_u8(packet_type);
    buf.put_u16((body_len / 4) as u16);
}

fn pad_to_word(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// RTCP Packet
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
    ApplicationDefined(ApplicationDefined),
    IntraFrameRequest(IntraFrameRequest),
}

impl RtcpPacket {
    /// Interpret a framed sub-packet
    pub fn from_raw(raw: &RawSubPacket) -> Result<Self, RtcpError> {
        let body = &raw.body[..];
        match RtcpPacketType::from_u8(raw.packet_type) {
            Some(RtcpPacketType::SR) => Ok(Self::SenderReport(SenderReport::parse_body(raw.count, body)?)),
            Some(RtcpPacketType::RR) => Ok(Self::ReceiverReport(ReceiverReport::parse_body(raw.count, body)?)),
            Some(RtcpPacketType::SDES) => Ok(Self::SourceDescription(SourceDescription::parse_body(raw.count, body)?)),
            Some(RtcpPacketType::BYE) => Ok(Self::Goodbye(Goodbye::parse_body(raw.count, body)?)),
            Some(RtcpPacketType::APP) => Ok(Self::ApplicationDefined(ApplicationDefined::parse_body(raw.count, body)?)),
            Some(RtcpPacketType::FIR) => Ok(Self::IntraFrameRequest(IntraFrameRequest::parse_body(body)?)),
            None => Err(RtcpError::UnsupportedPacketType(raw.packet_type)),
        }
    }

    pub fn packet_type(&self) -> RtcpPacketType {
        match self {
            Self::SenderReport(_) => RtcpPacketType::SR,
            Self::ReceiverReport(_) => RtcpPacketType::RR,
            Self::SourceDescription(_) => RtcpPacketType::SDES,
            Self::Goodbye(_) => RtcpPacketType::BYE,
            Self::ApplicationDefined(_) => RtcpPacketType::APP,
            Self::IntraFrameRequest(_) => RtcpPacketType::FIR,
        }
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            Self::SenderReport(sr) => sr.serialize_into(buf),
            Self::ReceiverReport(rr) => rr.serialize_into(buf),
            Self::SourceDescription(sdes) => sdes.serialize_into(buf),
            Self::Goodbye(bye) => bye.serialize_into(buf),
            Self::ApplicationDefined(app) => app.serialize_into(buf),
            Self::IntraFrameRequest(fir) => fir.serialize_into(buf),
        }
    }

    /// Serialize RTCP packet to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.freeze()
    }
}

fn parse_report_blocks(count: u8, mut buf: &[u8]) -> Result<Vec<ReceptionReport>, RtcpError> {
    if buf.len() < count as usize * REPORT_BLOCK_SIZE {
        return Err(RtcpError::Truncated);
    }
    Ok((0..count).map(|_| ReceptionReport::parse_from_buf(&mut buf)).collect())
}

/// Sender Report (SR)
#[derive(Debug, Clone, PartialEq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReceptionReport>,
}

impl SenderReport {
    pub fn new(ssrc: u32, rtp_timestamp: u32, packet_count: u32, octet_count: u32) -> Self {
        Self {
            ssrc,
            ntp_timestamp: ntp_now(),
            rtp_timestamp,
            packet_count,
            octet_count,
            reports: Vec::new(),
        }
    }

    pub fn add_report(&mut self, report: ReceptionReport) {
        if self.reports.len() < MAX_REPORT_BLOCKS {
            self.reports.push(report);
        }
    }

    fn parse_body(count: u8, data: &[u8]) -> Result<Self, RtcpError> {
        if data.len() < 24 {
            return Err(RtcpError::Truncated);
        }
        let mut buf = data;

        let ssrc = buf.get_u32();
        let ntp_timestamp = buf.get_u64();
        let rtp_timestamp = buf.get_u32();
        let packet_count = buf.get_u32();
        let octet_count = buf.get_u32();
        let reports = parse_report_blocks(count, buf)?;

        Ok(Self {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count,
            octet_count,
            reports,
        })
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        put_header(
            buf,
            self.reports.len() as u8,
            RtcpPacketType::SR as u8,
            24 + self.reports.len() * REPORT_BLOCK_SIZE,
        );

        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);

        for report in &self.reports {
            report.serialize_into_buf(buf);
        }
    }
}

/// Receiver Report (RR)
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            reports: Vec::new(),
        }
    }

    pub fn add_report(&mut self, report: ReceptionReport) {
        if self.reports.len() < MAX_REPORT_BLOCKS {
            self.reports.push(report);
        }
    }

    fn parse_body(count: u8, data: &[u8]) -> Result<Self, RtcpError> {
        if data.len() < 4 {
            return Err(RtcpError::Truncated);
        }
        let mut buf = data;
        let ssrc = buf.get_u32();
        let reports = parse_report_blocks(count, buf)?;
        Ok(Self { ssrc, reports })
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        put_header(
            buf,
            self.reports.len() as u8,
            RtcpPacketType::RR as u8,
            4 + self.reports.len() * REPORT_BLOCK_SIZE,
        );

        buf.put_u32(self.ssrc);

        for report in &self.reports {
            report.serialize_into_buf(buf);
        }
    }
}

/// Reception Report Block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24 bits on the wire
    pub cumulative_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,  // Last SR timestamp
    pub dlsr: u32, // Delay since last SR, 1/65536 s
}

impl ReceptionReport {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    fn parse_from_buf(buf: &mut &[u8]) -> Self {
        let ssrc = buf.get_u32();
        let lost = buf.get_u32();
        Self {
            ssrc,
            fraction_lost: (lost >> 24) as u8,
            cumulative_lost: lost & 0x00FF_FFFF,
            highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            lsr: buf.get_u32(),
            dlsr: buf.get_u32(),
        }
    }

    fn serialize_into_buf(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32(((self.fraction_lost as u32) << 24) | (self.cumulative_lost.min(0x00FF_FFFF)));
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.lsr);
        buf.put_u32(self.dlsr);
    }
}

/// SDES item types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdesItemType {
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Loc = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl SdesItemType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Cname),
            2 => Some(Self::Name),
            3 => Some(Self::Email),
            4 => Some(Self::Phone),
            5 => Some(Self::Loc),
            6 => Some(Self::Tool),
            7 => Some(Self::Note),
            8 => Some(Self::Priv),
            _ => None,
        }
    }
}

/// One SSRC and its description items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<(SdesItemType, String)>,
}

impl SdesChunk {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, kind: SdesItemType, text: impl Into<String>) -> Self {
        self.items.push((kind, text.into()));
        self
    }

    pub fn item(&self, kind: SdesItemType) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, text)| text.as_str())
    }

    fn encoded_len(&self) -> usize {
        let items: usize = self
            .items
            .iter()
            .map(|(_, text)| 2 + text.len().min(255))
            .sum();
        // ssrc + items + at least one terminating null, word aligned
        let len = 4 + items + 1;
        len + pad_to_word(len)
    }
}

/// Source Description (SDES)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    pub fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    pub fn add_chunk(&mut self, chunk: SdesChunk) {
        if self.chunks.len() < MAX_REPORT_BLOCKS {
            self.chunks.push(chunk);
        }
    }

    fn parse_body(count: u8, data: &[u8]) -> Result<Self, RtcpError> {
        let mut chunks = Vec::with_capacity(count as usize);
        let mut offset = 0;

        for _ in 0..count {
            if data.len() < offset + 4 {
                return Err(RtcpError::Truncated);
            }
            let ssrc = u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
            offset += 4;
            let mut chunk = SdesChunk::new(ssrc);

            loop {
                let kind = *data.get(offset).ok_or(RtcpError::Truncated)?;
                if kind == 0 {
                    // Null terminator, then skip to the next word boundary
                    offset += 1;
                    offset += pad_to_word(offset);
                    break;
                }
                let len = *data.get(offset + 1).ok_or(RtcpError::Truncated)? as usize;
                let text = data
                    .get(offset + 2..offset + 2 + len)
                    .ok_or(RtcpError::Truncated)?;
                if let Some(kind) = SdesItemType::from_u8(kind) {
                    chunk.items.push((kind, String::from_utf8_lossy(text).into_owned()));
                }
                offset += 2 + len;
            }

            chunks.push(chunk);
        }

        Ok(Self { chunks })
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        let body_len = self.chunks.iter().map(SdesChunk::encoded_len).sum();
        put_header(buf, self.chunks.len() as u8, RtcpPacketType::SDES as u8, body_len);

        for chunk in &self.chunks {
            let start = buf.len();
            buf.put_u32(chunk.ssrc);
            for (kind, text) in &chunk.items {
                let text = &text.as_bytes()[..text.len().min(255)];
                buf.put_u8(*kind as u8);
                buf.put_u8(text.len() as u8);
                buf.put_slice(text);
            }
            let written = buf.len() - start;
            buf.put_bytes(0, chunk.encoded_len() - written);
        }
    }
}

/// Goodbye (BYE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goodbye {
    pub ssrcs: Vec<u32>,
    pub reason: Option<String>,
}

impl Goodbye {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrcs: vec![ssrc],
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn parse_body(count: u8, data: &[u8]) -> Result<Self, RtcpError> {
        if data.len() < count as usize * 4 {
            return Err(RtcpError::Truncated);
        }
        let mut buf = data;
        let ssrcs = (0..count).map(|_| buf.get_u32()).collect();

        let reason = match buf.first() {
            Some(&len) if len > 0 => {
                let text = buf.get(1..1 + len as usize).ok_or(RtcpError::Truncated)?;
                Some(String::from_utf8_lossy(text).into_owned())
            }
            _ => None,
        };

        Ok(Self { ssrcs, reason })
    }

    fn reason_bytes(&self) -> &[u8] {
        self.reason
            .as_deref()
            .map(|r| &r.as_bytes()[..r.len().min(255)])
            .unwrap_or_default()
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        let ssrcs = &self.ssrcs[..self.ssrcs.len().min(MAX_REPORT_BLOCKS)];
        let reason = self.reason_bytes();
        let reason_len = if reason.is_empty() { 0 } else { 1 + reason.len() };
        let body_len = ssrcs.len() * 4 + reason_len + pad_to_word(reason_len);

        put_header(buf, ssrcs.len() as u8, RtcpPacketType::BYE as u8, body_len);

        for ssrc in ssrcs {
            buf.put_u32(*ssrc);
        }
        if !reason.is_empty() {
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason);
            buf.put_bytes(0, pad_to_word(reason_len));
        }
    }
}

/// Application Defined (APP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationDefined {
    pub subtype: u8,
    pub ssrc: u32,
    pub name: [u8; 4],
    pub data: Bytes,
}

impl ApplicationDefined {
    pub fn new(subtype: u8, ssrc: u32, name: [u8; 4], data: Bytes) -> Self {
        Self {
            subtype: subtype & 0x1F,
            ssrc,
            name,
            data,
        }
    }

    fn parse_body(subtype: u8, data: &[u8]) -> Result<Self, RtcpError> {
        if data.len() < 8 {
            return Err(RtcpError::Truncated);
        }
        let mut buf = data;
        let ssrc = buf.get_u32();
        let mut name = [0u8; 4];
        buf.copy_to_slice(&mut name);
        Ok(Self {
            subtype,
            ssrc,
            name,
            data: Bytes::copy_from_slice(buf),
        })
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        let pad = pad_to_word(self.data.len());
        put_header(buf, self.subtype, RtcpPacketType::APP as u8, 8 + self.data.len() + pad);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);
        buf.put_bytes(0, pad);
    }
}

/// Full Intra-frame Request, carries the SSRC of the stream to refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraFrameRequest {
    pub ssrc: u32,
}

impl IntraFrameRequest {
    fn parse_body(data: &[u8]) -> Result<Self, RtcpError> {
        if data.len() < 4 {
            return Err(RtcpError::Truncated);
        }
        let mut buf = data;
        Ok(Self { ssrc: buf.get_u32() })
    }

    fn serialize_into(&self, buf: &mut BytesMut) {
        put_header(buf, 0, RtcpPacketType::FIR as u8, 4);
        buf.put_u32(self.ssrc);
    }
}

/// RTCP Errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtcpError {
    #[error("Packet truncated")]
    Truncated,
    #[error("Bad version: {0}")]
    BadVersion(u8),
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
    #[error("Unsupported packet type: {0}")]
    UnsupportedPacketType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(packet: RtcpPacket) -> RtcpPacket {
        let data = packet.serialize();
        assert_eq!(data.len() % 4, 0);
        let raw = RtcpCompound::decode(&data).unwrap();
        assert_eq!(raw.len(), 1);
        RtcpPacket::from_raw(&raw[0]).unwrap()
    }

    #[test]
    fn test_sender_report() {
        let mut sr = SenderReport::new(0x12345678, 1000, 100, 16000);
        let mut block = ReceptionReport::new(0xCAFEBABE);
        block.fraction_lost = 12;
        block.cumulative_lost = 0x00ABCDEF;
        block.jitter = 33;
        sr.add_report(block);

        match single(RtcpPacket::SenderReport(sr.clone())) {
            RtcpPacket::SenderReport(parsed) => assert_eq!(parsed, sr),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bare_receiver_report() {
        let rr = ReceiverReport::new(0xAABBCCDD);
        let data = RtcpPacket::ReceiverReport(rr).serialize();
        assert_eq!(&data[..], &[0x80, 201, 0, 1, 0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn test_source_description_items() {
        let mut sdes = SourceDescription::new();
        sdes.add_chunk(
            SdesChunk::new(7)
                .with_item(SdesItemType::Cname, "alice@example.com")
                .with_item(SdesItemType::Tool, "rtp-session"),
        );
        sdes.add_chunk(SdesChunk::new(8).with_item(SdesItemType::Name, "bob"));

        match single(RtcpPacket::SourceDescription(sdes.clone())) {
            RtcpPacket::SourceDescription(parsed) => {
                assert_eq!(parsed, sdes);
                assert_eq!(parsed.chunks[0].item(SdesItemType::Cname), Some("alice@example.com"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_goodbye_with_reason() {
        let bye = Goodbye::new(0x11223344).with_reason("call ended");
        let data = RtcpPacket::Goodbye(bye.clone()).serialize();
        // 4 header + 4 ssrc + 1 + 10 reason + 1 pad
        assert_eq!(data.len(), 20);

        match single(RtcpPacket::Goodbye(bye.clone())) {
            RtcpPacket::Goodbye(parsed) => assert_eq!(parsed, bye),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_app_and_fir() {
        let app = ApplicationDefined::new(3, 9, *b"TEST", Bytes::from_static(b"xyz"));
        match single(RtcpPacket::ApplicationDefined(app)) {
            RtcpPacket::ApplicationDefined(parsed) => {
                assert_eq!(parsed.subtype, 3);
                assert_eq!(&parsed.name, b"TEST");
                assert_eq!(&parsed.data[..], b"xyz\0");
            }
            other => panic!("unexpected {:?}", other),
        }

        let fir = IntraFrameRequest { ssrc: 42 };
        assert_eq!(single(RtcpPacket::IntraFrameRequest(fir)), RtcpPacket::IntraFrameRequest(fir));
    }

    #[test]
    fn test_compound_lengths() {
        let packets = vec![
            RtcpPacket::ReceiverReport(ReceiverReport::new(1)),
            RtcpPacket::SourceDescription({
                let mut sdes = SourceDescription::new();
                sdes.add_chunk(SdesChunk::new(1).with_item(SdesItemType::Cname, "a"));
                sdes
            }),
            RtcpPacket::Goodbye(Goodbye::new(1)),
        ];
        let data = RtcpCompound::encode(&packets);
        let raw = RtcpCompound::decode(&data).unwrap();

        let declared: usize = raw.iter().map(|r| HEADER_SIZE + r.body.len()).sum();
        assert_eq!(declared, data.len());
        assert_eq!(
            raw.iter().map(|r| r.packet_type).collect::<Vec<_>>(),
            vec![201, 202, 203]
        );
    }

    #[test]
    fn test_compound_truncated() {
        let mut data = RtcpPacket::ReceiverReport(ReceiverReport::new(1)).serialize().to_vec();
        // Declare 3 words of body while only 1 is present
        data[3] = 3;
        assert_eq!(RtcpCompound::decode(&data), Err(RtcpError::Truncated));
    }

    #[test]
    fn test_compound_bad_version() {
        assert_eq!(
            RtcpCompound::decode(&[0x40, 201, 0, 0]),
            Err(RtcpError::BadVersion(1))
        );
    }

    #[test]
    fn test_report_block_count_exceeds_body() {
        let raw = RawSubPacket {
            count: 2,
            packet_type: 201,
            body: Bytes::from_static(&[0, 0, 0, 1]),
        };
        assert_eq!(RtcpPacket::from_raw(&raw), Err(RtcpError::Truncated));
    }

    #[test]
    fn test_ntp_middle() {
        let ntp = ntp_from_unix(Duration::from_millis(1500));
        assert_eq!(ntp >> 32, NTP_EPOCH_OFFSET + 1);
        assert_eq!(ntp_middle32(ntp) & 0xFFFF, 0x8000);
    }
}
