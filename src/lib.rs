//! A DHCPv4 server core: static reservations, multi-subnet
//! selection, PXE/BOOTP provisioning, RFC 2136 dynamic DNS with
//! TSIG, and active-active failover over an ISC-compatible peer
//! protocol. Lease state lives in a write-through cache persisted to
//! MySQL in batches.

pub mod config;
pub mod core;
pub mod ddns;
pub mod failover;
pub mod netio;
pub mod utils;
