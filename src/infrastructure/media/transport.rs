//! Media Transport
//!
//! Binds the data/control UDP pair for one session and runs the read loop
//! that feeds the session and the jitter buffer.

use super::encoding::{EncodingRegistry, EncodingSlot, EncodingStrategy};
use super::metrics;
use super::rtp::{classify, PacketClass, RtpPacket, RtpSession};
use crate::config::TransportConfig;
use crate::domain::shared::{Result, RtpSessionError, SessionEventKind};
use crate::infrastructure::protocols::nat::{NatAssist, NatType};
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

/// Smallest datagram that can hold an RTP header
pub const MIN_DATAGRAM_SIZE: usize = 12;

/// Which half of the pair a datagram travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Data,
    Control,
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Data => 0,
            Channel::Control => 1,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Channel::Data => "RTP",
            Channel::Control => "RTCP",
        }
    }
}

/// Type of service and buffer sizes from the transport config
fn apply_options(socket: SockRef<'_>, addr: SocketAddr, config: &TransportConfig) -> io::Result<()> {
    if let Some(tos) = config.type_of_service {
        if addr.is_ipv4() {
            socket.set_tos(tos as u32)?;
        } else {
            debug!("Type of service not applied to IPv6 socket {}", addr);
        }
    }
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(())
}

fn bind_udp(addr: SocketAddr, config: &TransportConfig) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    apply_options(SockRef::from(&socket), addr, config)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Bound data/control sockets
#[derive(Debug)]
pub struct SocketPair {
    pub data: UdpSocket,
    pub control: UdpSocket,
}

impl SocketPair {
    /// Acquire the pair, from the NAT helper if it has one, otherwise by
    /// searching for an even data port with control on the next port up.
    pub async fn open(config: &TransportConfig, nat: Option<&dyn NatAssist>) -> Result<Self> {
        if let Some(nat) = nat {
            if let Some((data, control)) = nat.allocate_pair(config.local_address).await {
                for socket in [&data, &control] {
                    apply_options(SockRef::from(socket), socket.local_addr()?, config)?;
                    socket.set_nonblocking(true)?;
                }
                let pair = Self {
                    data: UdpSocket::from_std(data)?,
                    control: UdpSocket::from_std(control)?,
                };
                info!(
                    "Using NAT assisted pair RTP {} RTCP {}",
                    pair.data.local_addr()?,
                    pair.control.local_addr()?
                );
                return Ok(pair);
            }
        }

        let (data, control) = Self::search(config)?;
        let pair = Self {
            data: UdpSocket::from_std(data)?,
            control: UdpSocket::from_std(control)?,
        };
        info!(
            "RTP socket bound to {}, RTCP socket bound to {}",
            pair.data.local_addr()?,
            pair.control.local_addr()?
        );
        Ok(pair)
    }

    fn search(config: &TransportConfig) -> Result<(std::net::UdpSocket, std::net::UdpSocket)> {
        let ip = config.local_address;
        // Zero lets the OS pick; odd picks are simply retried
        let mut port = match config.port_base {
            0 => 0,
            base => base.saturating_add(base & 1),
        };

        for _ in 0..config.max_port_attempts.max(1) {
            if port != 0 && port > config.port_max {
                break;
            }
            match bind_udp(SocketAddr::new(ip, port), config) {
                Ok(data) => {
                    let data_port = data.local_addr()?.port();
                    if data_port % 2 == 0 {
                        match bind_udp(SocketAddr::new(ip, data_port + 1), config) {
                            Ok(control) => return Ok((data, control)),
                            Err(e) => debug!("RTCP port {} unavailable: {}", data_port + 1, e),
                        }
                    }
                }
                Err(e) => debug!("RTP port {} unavailable: {}", port, e),
            }
            if port != 0 {
                port = match port.checked_add(2) {
                    Some(next) => next,
                    None => break,
                };
            }
        }

        Err(RtpSessionError::OpenFailed(format!(
            "no free port pair on {} in {}..={}",
            ip, config.port_base, config.port_max
        )))
    }
}

#[derive(Debug, Default)]
struct Remotes {
    addrs: [Option<SocketAddr>; 2],
    may_change: [bool; 2],
    punched: bool,
}

/// Run of consecutive transient write failures
#[derive(Debug, Default)]
struct WriteFailures {
    consecutive: u32,
    first_failure_at: Option<Instant>,
    notified: bool,
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Transport binding for one session
pub struct MediaTransport {
    session: Arc<RtpSession>,
    config: TransportConfig,
    registry: EncodingRegistry,
    encoding: EncodingSlot,
    data_socket: UdpSocket,
    control_socket: UdpSocket,
    local_data: SocketAddr,
    local_control: SocketAddr,
    nat_type: NatType,
    external_address: Option<IpAddr>,
    remotes: Mutex<Remotes>,
    write_failures: Mutex<WriteFailures>,
    shutdown_read: AtomicBool,
    shutdown_write: AtomicBool,
}

impl MediaTransport {
    /// Bind the socket pair and select the initial encoding by name
    pub async fn open(
        session: Arc<RtpSession>,
        config: TransportConfig,
        registry: EncodingRegistry,
        encoding: &str,
        nat: Option<&dyn NatAssist>,
    ) -> Result<Self> {
        let strategy = registry.create(encoding)?;
        let pair = SocketPair::open(&config, nat).await?;
        let local_data = pair.data.local_addr()?;
        let local_control = pair.control.local_addr()?;

        let (nat_type, external_address) = match nat {
            Some(nat) => (nat.nat_type(), nat.external_address()),
            None => (NatType::Unknown, None),
        };
        if let Some(external) = external_address {
            info!("Session {} external address {}", session.id(), external);
        }

        let mut remotes = Remotes::default();
        if let Some(data) = config.remote_data {
            remotes.addrs[Channel::Data.index()] = Some(data);
            let control = config
                .remote_control
                .unwrap_or_else(|| SocketAddr::new(data.ip(), data.port().wrapping_add(1)));
            remotes.addrs[Channel::Control.index()] = Some(control);
        } else if let Some(control) = config.remote_control {
            remotes.addrs[Channel::Control.index()] = Some(control);
        }

        let transport = Self {
            session,
            config,
            registry,
            encoding: EncodingSlot::new(strategy),
            data_socket: pair.data,
            control_socket: pair.control,
            local_data,
            local_control,
            nat_type,
            external_address,
            remotes: Mutex::new(remotes),
            write_failures: Mutex::new(WriteFailures::default()),
            shutdown_read: AtomicBool::new(false),
            shutdown_write: AtomicBool::new(false),
        };
        transport.punch().await?;
        Ok(transport)
    }

    fn lock_remotes(&self) -> MutexGuard<'_, Remotes> {
        self.remotes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failures(&self) -> MutexGuard<'_, WriteFailures> {
        self.write_failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &Arc<RtpSession> {
        &self.session
    }

    pub fn local_data_addr(&self) -> SocketAddr {
        self.local_data
    }

    pub fn local_control_addr(&self) -> SocketAddr {
        self.local_control
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.external_address
    }

    pub fn remote_data_addr(&self) -> Option<SocketAddr> {
        self.lock_remotes().addrs[Channel::Data.index()]
    }

    pub fn remote_control_addr(&self) -> Option<SocketAddr> {
        let remotes = self.lock_remotes();
        remotes.addrs[Channel::Control.index()].or_else(|| {
            remotes.addrs[Channel::Data.index()]
                .map(|data| SocketAddr::new(data.ip(), data.port().wrapping_add(1)))
        })
    }

    pub fn encoding_name(&self) -> String {
        self.encoding.current().name().to_string()
    }

    pub fn encoding_generation(&self) -> u64 {
        self.encoding.generation()
    }

    /// Set remote addresses
    pub async fn set_remote(&self, data: SocketAddr, control: SocketAddr) -> Result<()> {
        {
            let mut remotes = self.lock_remotes();
            remotes.addrs = [Some(data), Some(control)];
            remotes.punched = false;
        }
        info!("Remote RTP: {}, RTCP: {}", data, control);
        self.punch().await
    }

    /// Let the next datagram from a new source move each remote address once
    pub fn allow_remote_change(&self) {
        self.lock_remotes().may_change = [true, true];
    }

    /// Open the return path through a port restricted NAT with one empty
    /// datagram per channel
    async fn punch(&self) -> Result<()> {
        if !self.nat_type.needs_punch() {
            return Ok(());
        }
        let targets = {
            let mut remotes = self.lock_remotes();
            match remotes.addrs {
                [Some(data), Some(control)] if !remotes.punched => {
                    remotes.punched = true;
                    Some((data, control))
                }
                _ => None,
            }
        };
        if let Some((data, control)) = targets {
            debug!("Punching NAT towards {} and {}", data, control);
            self.write(&self.data_socket, &[], data).await?;
            self.write(&self.control_socket, &[], control).await?;
        }
        Ok(())
    }

    /// Check a datagram source against the remote for the channel, learning
    /// it if none is known yet
    fn accept_source(&self, channel: Channel, from: SocketAddr) -> bool {
        let mut remotes = self.lock_remotes();
        let i = channel.index();
        match remotes.addrs[i] {
            None => {
                remotes.addrs[i] = Some(from);
                info!(
                    "Session {} learned remote {} address {}",
                    self.session.id(),
                    channel.as_str(),
                    from
                );
                true
            }
            Some(addr) if addr == from => true,
            Some(addr) if self.config.remote_behind_nat || remotes.may_change[i] => {
                remotes.addrs[i] = Some(from);
                remotes.may_change[i] = false;
                info!(
                    "Session {} remote {} address changed {} -> {}",
                    self.session.id(),
                    channel.as_str(),
                    addr,
                    from
                );
                true
            }
            Some(_) => {
                let error = RtpSessionError::UnexpectedSource(from);
                debug!("Dropping {} datagram: {}", channel.as_str(), error);
                false
            }
        }
    }

    /// Encode and send a media packet to the remote data address
    pub async fn send(&self, packet: &mut RtpPacket) -> Result<()> {
        if self.shutdown_write.load(Ordering::Acquire) {
            return Err(RtpSessionError::Closed);
        }
        let strategy = self.encoding.current();
        let datagram = strategy.encode_data(&self.session, packet)?;

        match self.remote_data_addr() {
            Some(remote) => self.write(&self.data_socket, &datagram, remote).await,
            None => {
                warn!("No remote RTP address set");
                Ok(())
            }
        }
    }

    /// Encode and send a control compound to the remote control address
    pub async fn send_control(&self, compound: Bytes) -> Result<()> {
        if self.shutdown_write.load(Ordering::Acquire) {
            return Err(RtpSessionError::Closed);
        }
        let strategy = self.encoding.current();
        self.write_control(strategy.as_ref(), compound).await.map(|_| ())
    }

    /// Returns whether there was somewhere to send it
    async fn write_control(&self, strategy: &dyn EncodingStrategy, compound: Bytes) -> Result<bool> {
        let datagram = strategy.encode_control(&self.session, compound)?;
        match self.remote_control_addr() {
            Some(remote) => {
                self.write(&self.control_socket, &datagram, remote).await?;
                Ok(true)
            }
            None => {
                debug!("No remote RTCP address set");
                Ok(false)
            }
        }
    }

    /// Send a report now, unless one is already on its way
    pub async fn send_report(&self) -> Result<bool> {
        let now = Instant::now();
        let Some(report) = self.session.force_report(now) else {
            return Ok(false);
        };
        let strategy = self.encoding.current();
        let sent = self.write_control(strategy.as_ref(), report).await;
        match sent {
            Ok(true) => self.session.report_sent(),
            _ => self.session.report_skipped(),
        }
        sent
    }

    async fn write(&self, socket: &UdpSocket, datagram: &[u8], remote: SocketAddr) -> Result<()> {
        match socket.send_to(datagram, remote).await {
            Ok(_) => {
                self.write_succeeded();
                Ok(())
            }
            Err(e) if is_transient(&e) => {
                self.write_failed(remote, e, Instant::now());
                Ok(())
            }
            Err(e) => {
                error!("Write to {} failed: {}", remote, e);
                Err(RtpSessionError::Io(e))
            }
        }
    }

    fn write_succeeded(&self) {
        let mut failures = self.lock_failures();
        if failures.consecutive > 0 {
            debug!(
                "Writes recovered after {} failures",
                failures.consecutive
            );
            *failures = WriteFailures::default();
        }
    }

    /// Swallow a refused/reset write; escalate once per run if the run
    /// outlasts the threshold
    fn write_failed(&self, remote: SocketAddr, source: io::Error, now: Instant) {
        metrics::record_write_failure();
        let error = RtpSessionError::WriteTransient {
            addr: remote,
            source,
        };
        debug!("{}", error);

        let mut failures = self.lock_failures();
        failures.consecutive += 1;
        let first = *failures.first_failure_at.get_or_insert(now);
        if failures.notified || now.duration_since(first) < self.config.write_failure_threshold() {
            return;
        }
        failures.notified = true;
        let consecutive_failures = failures.consecutive;
        drop(failures);

        warn!(
            "Session {} writes to {} failing for {:?}",
            self.session.id(),
            remote,
            now.duration_since(first)
        );
        self.session.emit(SessionEventKind::Failing {
            consecutive_failures,
            remote,
        });
    }

    /// Read both channels until read shutdown or a fatal socket error.
    ///
    /// Accepted media packets are handed to `jitter` in arrival order.
    pub async fn run(&self, jitter: mpsc::Sender<RtpPacket>) -> Result<()> {
        let size = self.config.max_datagram_size.max(MIN_DATAGRAM_SIZE);
        let mut data_buf = vec![0u8; size];
        let mut control_buf = vec![0u8; size];
        info!("Session {} read loop started", self.session.id());

        let result = loop {
            if self.shutdown_read.load(Ordering::Acquire) {
                break Ok(());
            }
            let strategy = self.encoding.current();
            let wait = strategy.idle_timeout(&self.session, Instant::now());

            let step = tokio::select! {
                received = self.data_socket.recv_from(&mut data_buf) => match received {
                    Ok((len, from)) => {
                        self.on_data(strategy.as_ref(), &data_buf[..len], from, &jitter);
                        Ok(())
                    }
                    Err(e) => self.on_read_error(Channel::Data, e),
                },
                received = self.control_socket.recv_from(&mut control_buf) => match received {
                    Ok((len, from)) => {
                        self.on_control(strategy.as_ref(), &control_buf[..len], from);
                        Ok(())
                    }
                    Err(e) => self.on_read_error(Channel::Control, e),
                },
                _ = tokio::time::sleep(wait) => self.on_idle(strategy.as_ref()).await,
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        self.session.mark_closed();
        info!("Session {} read loop stopped", self.session.id());
        result
    }

    fn on_data(
        &self,
        strategy: &dyn EncodingStrategy,
        datagram: &[u8],
        from: SocketAddr,
        jitter: &mpsc::Sender<RtpPacket>,
    ) {
        // NAT punches and wake-ups carry nothing
        if datagram.is_empty() {
            return;
        }
        if !self.accept_source(Channel::Data, from) {
            self.session.record_rejected();
            metrics::record_discard("unexpected_source");
            return;
        }
        if datagram.len() < MIN_DATAGRAM_SIZE {
            debug!("Short RTP datagram from {}: {} bytes", from, datagram.len());
            self.session.record_malformed();
            return;
        }
        if classify(datagram) == PacketClass::Control {
            debug!("RTCP received on RTP port from {}", from);
            strategy.decode_control(&self.session, datagram);
            return;
        }

        let Some(packet) = strategy.decode_data(&self.session, datagram, Instant::now()) else {
            return;
        };
        // The read loop never waits on the jitter buffer
        match jitter.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                debug!("Jitter buffer full, dropping sequence {}", packet.sequence);
                self.session.record_too_late(1);
                metrics::record_discard("jitter_full");
            }
            Err(TrySendError::Closed(_)) => debug!("Jitter buffer gone, dropping packet"),
        }
    }

    fn on_control(&self, strategy: &dyn EncodingStrategy, datagram: &[u8], from: SocketAddr) {
        if datagram.is_empty() {
            return;
        }
        if !self.accept_source(Channel::Control, from) {
            self.session.record_rejected();
            metrics::record_discard("unexpected_source");
            return;
        }
        let handled = strategy.decode_control(&self.session, datagram);
        debug!("RTCP from {}: {} sub-packets handled", from, handled);
    }

    /// Refused/reset reads are ICMP echoes of our own writes
    fn on_read_error(&self, channel: Channel, e: io::Error) -> Result<()> {
        if is_transient(&e) {
            debug!("{} read after failed write: {}", channel.as_str(), e);
            return Ok(());
        }
        if self.shutdown_read.load(Ordering::Acquire) {
            return Ok(());
        }
        error!("{} recv error: {}", channel.as_str(), e);
        Err(RtpSessionError::Io(e))
    }

    async fn on_idle(&self, strategy: &dyn EncodingStrategy) -> Result<()> {
        let now = Instant::now();
        let datagram = match strategy.wait_for_activity(&self.session, now) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("Failed to encode RTCP report: {}", e);
                self.session.report_skipped();
                return Ok(());
            }
        };
        let remote = match self.remote_control_addr() {
            Some(remote) if !self.shutdown_write.load(Ordering::Acquire) => remote,
            _ => {
                debug!("Report skipped, nowhere to send it");
                self.session.report_skipped();
                return Ok(());
            }
        };
        let written = self.write(&self.control_socket, &datagram, remote).await;
        self.session.report_sent();
        debug!("Sent RTCP report to {}", remote);
        written
    }

    /// Swap the active encoding; starts a new logical session on the same
    /// sockets
    pub fn swap_encoding(&self, name: &str) -> Result<u64> {
        let strategy = self.registry.create(name)?;
        Ok(self.encoding.swap(strategy, &self.session))
    }

    /// Stop writers; later sends fail with `Closed`
    pub fn shutdown_write(&self) {
        self.shutdown_write.store(true, Ordering::Release);
        debug!("Session {} write side shut down", self.session.id());
    }

    /// Stop the read loop, waking it if it is blocked
    pub async fn shutdown_read(&self) {
        if self.shutdown_read.swap(true, Ordering::AcqRel) {
            return;
        }
        let ip = match self.local_control.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let own = SocketAddr::new(ip, self.local_control.port());
        if let Err(e) = self.data_socket.send_to(&[], own).await {
            warn!("Failed to wake read loop: {}", e);
        }
        debug!("Session {} read side shut down", self.session.id());
    }

    pub async fn shutdown(&self) {
        self.shutdown_write();
        self.shutdown_read().await;
    }

    /// Send the closing reports and Goodbye, then shut both directions down
    pub async fn close(&self, reason: &str) -> Result<()> {
        let strategy = self.encoding.current();
        let mut result = Ok(());
        if !self.shutdown_write.load(Ordering::Acquire) {
            for compound in self.session.close(reason) {
                if let Err(e) = self.write_control(strategy.as_ref(), compound).await {
                    warn!("Failed to send closing RTCP: {}", e);
                    result = Err(e);
                    break;
                }
            }
        }
        self.shutdown().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::domain::shared::SessionEvent;
    use crate::infrastructure::media::encoding::PLAIN;
    use crate::infrastructure::protocols::nat::MockNatAssist;
    use std::time::Duration;

    fn loopback() -> TransportConfig {
        TransportConfig {
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_base: 0,
            ..Default::default()
        }
    }

    async fn transport(config: TransportConfig) -> (MediaTransport, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(RtpSession::new(SessionConfig::default()).with_events(tx));
        let transport = MediaTransport::open(session, config, EncodingRegistry::new(), PLAIN, None)
            .await
            .unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_pair_is_even_and_adjacent() {
        let pair = SocketPair::open(&loopback(), None).await.unwrap();
        let data = pair.data.local_addr().unwrap().port();
        let control = pair.control.local_addr().unwrap().port();
        assert_eq!(data % 2, 0);
        assert_eq!(control, data + 1);
    }

    #[tokio::test]
    async fn test_open_fails_when_range_taken() {
        let blocker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let base = taken & !1;
        let config = TransportConfig {
            port_base: base,
            port_max: base + 1,
            ..loopback()
        };

        let result = SocketPair::open(&config, None).await;
        assert!(matches!(result, Err(RtpSessionError::OpenFailed(_))));
    }

    #[tokio::test]
    async fn test_nat_pair_preferred() {
        let data = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let control = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let expected = (data.local_addr().unwrap(), control.local_addr().unwrap());
        let mut pair = Some((data, control));

        let mut nat = MockNatAssist::new();
        nat.expect_allocate_pair().returning(move |_| pair.take());
        nat.expect_nat_type().return_const(NatType::FullCone);
        nat.expect_external_address()
            .return_const(Some("203.0.113.9".parse::<IpAddr>().unwrap()));

        let session = Arc::new(RtpSession::new(SessionConfig::default()));
        let nat: &dyn NatAssist = &nat;
        let transport =
            MediaTransport::open(session, loopback(), EncodingRegistry::new(), PLAIN, Some(nat))
                .await
                .unwrap();
        assert_eq!(transport.local_data_addr(), expected.0);
        assert_eq!(transport.local_control_addr(), expected.1);
        assert_eq!(transport.external_address(), Some("203.0.113.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_nat_pair_gets_socket_options() {
        let data = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let control = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut pair = Some((data, control));

        let mut nat = MockNatAssist::new();
        nat.expect_allocate_pair().returning(move |_| pair.take());

        let config = TransportConfig {
            type_of_service: Some(0xB8),
            recv_buffer_size: Some(256 * 1024),
            ..loopback()
        };
        let nat: &dyn NatAssist = &nat;
        let pair = SocketPair::open(&config, Some(nat)).await.unwrap();

        for socket in [&pair.data, &pair.control] {
            let socket = SockRef::from(socket);
            assert_eq!(socket.tos().unwrap(), 0xB8);
            assert!(socket.recv_buffer_size().unwrap() >= 256 * 1024);
        }
    }

    #[tokio::test]
    async fn test_punch_for_port_restricted_nat() {
        let remote_data = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_control = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut nat = MockNatAssist::new();
        nat.expect_allocate_pair().returning(|_| None);
        nat.expect_nat_type().return_const(NatType::PortRestrictedCone);
        nat.expect_external_address().return_const(None::<IpAddr>);

        let config = TransportConfig {
            remote_data: Some(remote_data.local_addr().unwrap()),
            remote_control: Some(remote_control.local_addr().unwrap()),
            ..loopback()
        };
        let session = Arc::new(RtpSession::new(SessionConfig::default()));
        let nat: &dyn NatAssist = &nat;
        let transport =
            MediaTransport::open(session, config, EncodingRegistry::new(), PLAIN, Some(nat))
                .await
                .unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), remote_data.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(len, 0);
        assert_eq!(from, transport.local_data_addr());

        let (len, from) =
            tokio::time::timeout(Duration::from_secs(2), remote_control.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(len, 0);
        assert_eq!(from, transport.local_control_addr());
    }

    #[tokio::test]
    async fn test_remote_learned_then_locked() {
        let (transport, _events) = transport(loopback()).await;
        let first: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        assert!(transport.accept_source(Channel::Data, first));
        assert_eq!(transport.remote_data_addr(), Some(first));
        assert!(!transport.accept_source(Channel::Data, other));

        transport.allow_remote_change();
        assert!(transport.accept_source(Channel::Data, other));
        assert_eq!(transport.remote_data_addr(), Some(other));
        // One shot
        assert!(!transport.accept_source(Channel::Data, first));

        // Channels are learned independently
        assert!(transport.accept_source(Channel::Control, first));
    }

    #[tokio::test]
    async fn test_remote_behind_nat_follows_source() {
        let config = TransportConfig {
            remote_behind_nat: true,
            remote_data: Some("127.0.0.1:40000".parse().unwrap()),
            ..loopback()
        };
        let (transport, _events) = transport(config).await;
        let moved: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        assert!(transport.accept_source(Channel::Data, moved));
        assert_eq!(transport.remote_data_addr(), Some(moved));
        assert_eq!(
            transport.remote_control_addr(),
            Some("127.0.0.1:40001".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_write_failures_escalate_once_per_run() {
        let (transport, mut events) = transport(loopback()).await;
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let start = Instant::now();
        let refused = || io::Error::from(io::ErrorKind::ConnectionRefused);

        transport.write_failed(remote, refused(), start);
        transport.write_failed(remote, refused(), start + Duration::from_secs(5));
        assert!(events.try_recv().is_err());

        transport.write_failed(remote, refused(), start + Duration::from_secs(10));
        transport.write_failed(remote, refused(), start + Duration::from_secs(15));
        let failing: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e.kind, SessionEventKind::Failing { .. }))
            .collect();
        assert_eq!(failing.len(), 1);
        assert_eq!(
            failing[0].kind,
            SessionEventKind::Failing {
                consecutive_failures: 3,
                remote
            }
        );

        // A success starts a new run
        transport.write_succeeded();
        let later = start + Duration::from_secs(60);
        transport.write_failed(remote, refused(), later);
        transport.write_failed(remote, refused(), later + Duration::from_secs(11));
        assert!(matches!(
            events.try_recv().map(|e| e.kind),
            Ok(SessionEventKind::Failing { consecutive_failures: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_send_after_write_shutdown() {
        let (transport, _events) = transport(loopback()).await;
        transport.shutdown_write();
        let mut packet = RtpPacket::new(0, 0, 0, 0, Bytes::from_static(&[0; 20]));
        assert!(matches!(
            transport.send(&mut packet).await,
            Err(RtpSessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_swap_encoding() {
        let (transport, _events) = transport(loopback()).await;
        assert!(matches!(
            transport.swap_encoding("missing"),
            Err(RtpSessionError::UnknownEncoding(_))
        ));
        assert_eq!(transport.swap_encoding(PLAIN).unwrap(), 1);
        assert_eq!(transport.encoding_generation(), 1);
        assert_eq!(transport.encoding_name(), PLAIN);
    }
}
