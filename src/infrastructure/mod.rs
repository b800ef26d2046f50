//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Media wire formats, session engine and transport
//! - Protocol helpers consumed by the transport (NAT)

pub mod media;
pub mod protocols;
