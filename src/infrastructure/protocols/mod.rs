//! Protocol helpers consumed by the media transport

pub mod nat;

pub use nat::{NatAssist, NatState, NatType, StaticNatAssist};
