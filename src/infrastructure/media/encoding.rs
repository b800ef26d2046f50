//! Wire encoding strategies
//!
//! A strategy sits between the transport and the session: it turns packets
//! into datagrams and back. Exactly one strategy is active per session, held
//! in an [`EncodingSlot`] that can be swapped while traffic is flowing.

use super::rtp::{ReceiveOutcome, RtpPacket, RtpSession};
use crate::domain::shared::{Result, RtpSessionError};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Transforms datagrams in place, e.g. SRTP style encryption and
/// authentication
pub trait PacketProtector: Send + Sync {
    fn protect_data(&self, packet: &mut Vec<u8>) -> Result<()>;
    fn unprotect_data(&self, packet: &mut Vec<u8>) -> Result<()>;
    fn protect_control(&self, packet: &mut Vec<u8>) -> Result<()>;
    fn unprotect_control(&self, packet: &mut Vec<u8>) -> Result<()>;
}

/// Send and receive operations of one wire format
pub trait EncodingStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Stamp the packet through the session and produce the datagram
    fn encode_data(&self, session: &RtpSession, packet: &mut RtpPacket) -> Result<Bytes>;

    /// Produce the datagram for an encoded control compound
    fn encode_control(&self, session: &RtpSession, compound: Bytes) -> Result<Bytes>;

    /// Decode a data datagram and account for it in the session.
    ///
    /// Returns the packet only if the session accepted it for playout.
    fn decode_data(&self, session: &RtpSession, datagram: &[u8], arrival: Instant)
        -> Option<RtpPacket>;

    /// Decode a control datagram and apply it; returns sub-packets acted on
    fn decode_control(&self, session: &RtpSession, datagram: &[u8]) -> usize;

    /// Called when the read wait timed out; returns a datagram to send on
    /// the control channel, if any
    fn wait_for_activity(&self, session: &RtpSession, now: Instant) -> Result<Option<Bytes>> {
        session
            .periodic_report(now)
            .map(|report| self.encode_control(session, report))
            .transpose()
    }

    /// How long the read loop may block without traffic
    fn idle_timeout(&self, session: &RtpSession, now: Instant) -> Duration {
        session.next_report_in(now)
    }
}

fn deliver(session: &RtpSession, packet: RtpPacket, arrival: Instant) -> Option<RtpPacket> {
    match session.on_receive(&packet, arrival) {
        ReceiveOutcome::Deliver => Some(packet),
        ReceiveOutcome::Discard(reason) => {
            debug!("Discarded sequence {}: {}", packet.sequence, reason.as_str());
            None
        }
    }
}

fn parse_data(session: &RtpSession, datagram: &[u8]) -> Option<RtpPacket> {
    match RtpPacket::parse(datagram) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!("Failed to parse RTP packet: {}", e);
            session.record_malformed();
            None
        }
    }
}

/// Datagrams are the packets themselves
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainEncoding;

impl EncodingStrategy for PlainEncoding {
    fn name(&self) -> &str {
        PLAIN
    }

    fn encode_data(&self, session: &RtpSession, packet: &mut RtpPacket) -> Result<Bytes> {
        session.on_send(packet)?;
        Ok(packet.serialize())
    }

    fn encode_control(&self, _session: &RtpSession, compound: Bytes) -> Result<Bytes> {
        Ok(compound)
    }

    fn decode_data(
        &self,
        session: &RtpSession,
        datagram: &[u8],
        arrival: Instant,
    ) -> Option<RtpPacket> {
        let packet = parse_data(session, datagram)?;
        deliver(session, packet, arrival)
    }

    fn decode_control(&self, session: &RtpSession, datagram: &[u8]) -> usize {
        session.handle_control(datagram)
    }
}

/// Plain framing with every datagram passed through a [`PacketProtector`]
pub struct SecuredEncoding<P> {
    protector: Arc<P>,
}

impl<P: PacketProtector> SecuredEncoding<P> {
    pub fn new(protector: Arc<P>) -> Self {
        Self { protector }
    }
}

impl<P> fmt::Debug for SecuredEncoding<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuredEncoding").finish_non_exhaustive()
    }
}

impl<P: PacketProtector> EncodingStrategy for SecuredEncoding<P> {
    fn name(&self) -> &str {
        SECURED
    }

    fn encode_data(&self, session: &RtpSession, packet: &mut RtpPacket) -> Result<Bytes> {
        session.on_send(packet)?;
        let mut buf = packet.serialize().to_vec();
        self.protector.protect_data(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn encode_control(&self, _session: &RtpSession, compound: Bytes) -> Result<Bytes> {
        let mut buf = compound.to_vec();
        self.protector.protect_control(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn decode_data(
        &self,
        session: &RtpSession,
        datagram: &[u8],
        arrival: Instant,
    ) -> Option<RtpPacket> {
        let mut buf = datagram.to_vec();
        if let Err(e) = self.protector.unprotect_data(&mut buf) {
            warn!("Failed to unprotect RTP packet: {}", e);
            session.record_malformed();
            return None;
        }
        let packet = parse_data(session, &buf)?;
        deliver(session, packet, arrival)
    }

    fn decode_control(&self, session: &RtpSession, datagram: &[u8]) -> usize {
        let mut buf = datagram.to_vec();
        match self.protector.unprotect_control(&mut buf) {
            Ok(()) => session.handle_control(&buf),
            Err(e) => {
                warn!("Failed to unprotect RTCP packet: {}", e);
                session.record_malformed();
                0
            }
        }
    }
}

pub const PLAIN: &str = "plain";
pub const SECURED: &str = "secured";

type Factory = Arc<dyn Fn() -> Arc<dyn EncodingStrategy> + Send + Sync>;

/// Named encoding factories, handed to the transport at construction
#[derive(Clone)]
pub struct EncodingRegistry {
    factories: HashMap<String, Factory>,
}

impl EncodingRegistry {
    /// Registry knowing only the plain encoding
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(PLAIN, || Arc::new(PlainEncoding));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn EncodingStrategy> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register [`SecuredEncoding`] sharing one protector
    pub fn register_secured<P: PacketProtector + 'static>(&mut self, protector: Arc<P>) {
        self.register(SECURED, move || Arc::new(SecuredEncoding::new(protector.clone())));
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn EncodingStrategy>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RtpSessionError::UnknownEncoding(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for EncodingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EncodingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodingRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// The active strategy of a session.
///
/// Operations take a clone of the current `Arc`, so a swap never pulls the
/// strategy out from under a send or receive in progress.
pub struct EncodingSlot {
    current: RwLock<Arc<dyn EncodingStrategy>>,
    generation: AtomicU64,
}

impl EncodingSlot {
    pub fn new(strategy: Arc<dyn EncodingStrategy>) -> Self {
        Self {
            current: RwLock::new(strategy),
            generation: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Arc<dyn EncodingStrategy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Install a new strategy and start a new logical session.
    ///
    /// Returns the new generation.
    pub fn swap(&self, strategy: Arc<dyn EncodingStrategy>, session: &RtpSession) -> u64 {
        let name = strategy.name().to_string();
        let previous = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, strategy)
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        session.reset();
        info!(
            "Session {} encoding {} -> {} (generation {})",
            session.id(),
            previous.name(),
            name,
            generation
        );
        generation
    }
}

impl fmt::Debug for EncodingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodingSlot")
            .field("current", &self.current().name())
            .field("generation", &self.generation())
            .finish()
    }
}
