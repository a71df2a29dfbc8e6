//! Active-active high availability over an ISC-compatible failover
//! protocol.

pub mod frame;
pub mod peer;
pub mod state;
