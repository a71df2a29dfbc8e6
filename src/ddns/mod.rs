//! RFC 2136 dynamic DNS updates with TSIG signing.

pub mod client;
pub mod hmac;
pub mod message;
pub mod tsig;
