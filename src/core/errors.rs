//! Error taxonomy for the packet pipeline.
//!
//! Everything below the dispatcher is caught at the packet boundary:
//! a failed decode drops the frame, a denied allocation turns into a
//! NAK or silence, and persistence or replication trouble never
//! reaches the client.

use std::net::Ipv4Addr;

use thiserror::Error;

use super::packet::HardwareAddress;

/// Raised while turning a raw frame into a [`DhcpV4Packet`].
///
/// [`DhcpV4Packet`]: super::packet::DhcpV4Packet
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame shorter than the 236-byte fixed BOOTP header.
    #[error("frame too short for the fixed BOOTP header ({0} bytes)")]
    ShortFrame(usize),
    /// Bytes 236..240 did not carry the RFC 2131 magic cookie.
    #[error("magic cookie mismatch")]
    BadMagic,
    /// The op field was not BOOTREQUEST.
    #[error("op field {0} is not BOOTREQUEST")]
    NotRequest(u8),
}

/// Denial reasons produced while resolving an address for a client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    /// No free address survived the pool walk.
    #[error("no free address in any eligible pool")]
    Exhausted,
    /// The requested address is held by a different client.
    #[error("address {addr} is leased to {holder}")]
    LeaseConflict {
        addr: Ipv4Addr,
        holder: HardwareAddress,
    },
    /// The client asked for an address other than its reservation.
    #[error("address {addr} does not match the reservation for {hw}")]
    ReservationMismatch {
        addr: Ipv4Addr,
        hw: HardwareAddress,
    },
    /// The requested address lies outside the selected subnet.
    #[error("address {0} is out of range for the selected subnet")]
    OutOfRange(Ipv4Addr),
    /// The address sits in the declined-address quarantine.
    #[error("address {0} is quarantined after a DECLINE")]
    Quarantined(Ipv4Addr),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Sql(#[from] mysql::Error),
    #[error("the write channel is closed")]
    ChannelClosed,
}

/// DDNS failures are logged and recorded, never surfaced to the client.
#[derive(Debug, Error)]
pub enum DdnsError {
    #[error("the server answered RCODE {0}")]
    Rcode(crate::ddns::message::Rcode),
    #[error("no answer within the 5 s window")]
    Timeout,
    #[error("TSIG secret is not valid base64")]
    BadSecret,
    #[error("unsupported TSIG algorithm {0:?}")]
    BadAlgorithm(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("peer rejected CONNECT with reason {0}")]
    PeerRejected(u8),
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),
    #[error("connection lost: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer did not acknowledge within the window")]
    AckTimeout,
}

/// Init-time errors are the only ones that terminate the process.
#[derive(Debug, Error)]
pub enum FatalInit {
    #[error("database unreachable: {0}")]
    Database(#[from] mysql::Error),
    #[error("cannot bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("misconfigured failover role {0:?}")]
    BadRole(String),
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),
}
