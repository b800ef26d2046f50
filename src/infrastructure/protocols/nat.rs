//! NAT helper seam
//!
//! The transport never runs NAT discovery itself; it only consumes the outcome
//! (a pre-traversed socket pair, an external address and the NAT type) from
//! whatever implements [`NatAssist`].

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use tracing::debug;

/// NAT behavior of the local network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// No NAT (direct internet connection)
    OpenInternet,
    /// Full cone NAT
    FullCone,
    /// Restricted cone NAT
    RestrictedCone,
    /// Port restricted cone NAT
    PortRestrictedCone,
    /// Symmetric NAT
    Symmetric,
    /// Unknown/Error
    Unknown,
}

impl NatType {
    /// Return traffic is only let in after we sent to the exact remote port
    pub fn needs_punch(&self) -> bool {
        matches!(self, NatType::PortRestrictedCone)
    }
}

/// Outcome of NAT traversal for the local host
#[derive(Debug, Clone)]
pub struct NatState {
    pub nat_type: NatType,
    pub public_ip: Option<IpAddr>,
    pub local_addr: SocketAddr,
}

/// Provider of NAT traversal results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NatAssist: Send + Sync {
    /// Pre-traversed (data, control) socket pair, if the helper can supply one
    async fn allocate_pair(&self, local: IpAddr) -> Option<(UdpSocket, UdpSocket)>;

    /// Address the remote sees us as
    fn external_address(&self) -> Option<IpAddr>;

    fn nat_type(&self) -> NatType;
}

/// Helper backed by an already discovered [`NatState`]; never allocates
#[derive(Debug, Clone)]
pub struct StaticNatAssist {
    state: NatState,
}

impl StaticNatAssist {
    pub fn new(state: NatState) -> Self {
        Self { state }
    }

    /// No NAT between us and the remote
    pub fn direct(local_addr: SocketAddr) -> Self {
        Self::new(NatState {
            nat_type: NatType::OpenInternet,
            public_ip: Some(local_addr.ip()),
            local_addr,
        })
    }
}

#[async_trait]
impl NatAssist for StaticNatAssist {
    async fn allocate_pair(&self, local: IpAddr) -> Option<(UdpSocket, UdpSocket)> {
        debug!("No pre-traversed pair for {}", local);
        None
    }

    fn external_address(&self) -> Option<IpAddr> {
        self.state.public_ip
    }

    fn nat_type(&self) -> NatType {
        self.state.nat_type
    }
}
