//! Sends UPDATE messages to the configured resolver and interprets
//! the answer.
//!
//! Forward (A) and reverse (PTR) updates are independent messages;
//! each attempt is logged to `ddns_log`. Nothing here can fail a
//! DHCP reply: callers run the updater on a spawned task after the
//! reply bytes are already on the wire.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::model::DdnsConfig;
use crate::core::errors::DdnsError;
use crate::utils::data::DbManager;

use super::message::{response_rcode, Rcode, UpdateMessage};
use super::tsig::{self, TsigKey};

/// Send and receive budget per message.
pub const DNS_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// One row for `ddns_log`.
#[derive(Debug, Clone)]
pub struct DdnsLogEntry {
    pub config_id: u32,
    pub fqdn: String,
    pub record_type: &'static str,
    pub address: Ipv4Addr,
    pub success: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

pub struct DdnsUpdater {
    db: Option<Arc<DbManager>>,
}

impl DdnsUpdater {
    pub fn new(db: Option<Arc<DbManager>>) -> Self {
        Self { db }
    }

    /// Builds the FQDN: trailing dots are stripped from both parts;
    /// a hostname that already carries the zone is kept as is.
    pub fn fqdn(hostname: &str, zone: &str) -> String {
        let hostname = hostname.trim_end_matches('.');
        let zone = zone.trim_end_matches('.');
        if hostname
            .to_ascii_lowercase()
            .ends_with(&zone.to_ascii_lowercase())
        {
            format!("{}.", hostname)
        } else {
            format!("{}.{}.", hostname, zone)
        }
    }

    /// The zone holding the PTR record; derived from the address
    /// when not configured.
    pub fn reverse_zone(config: &DdnsConfig, addr: Ipv4Addr) -> String {
        config.reverse_zone.clone().unwrap_or_else(|| {
            let o = addr.octets();
            format!("{}.{}.{}.in-addr.arpa", o[2], o[1], o[0])
        })
    }

    /// The PTR owner name, octets reversed.
    pub fn reverse_name(addr: Ipv4Addr) -> String {
        let o = addr.octets();
        format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
    }

    /// A + PTR registration after an ACK. Each direction is its own
    /// message and its own verdict.
    pub async fn register(&self, config: &DdnsConfig, hostname: &str, addr: Ipv4Addr) {
        let fqdn = Self::fqdn(hostname, &config.forward_zone);

        let mut forward = UpdateMessage::new(rand::random(), &config.forward_zone);
        forward.add_a(&fqdn, config.ttl, addr);
        let outcome = self.send(config, forward).await;
        self.record(config, &fqdn, "A", addr, &outcome).await;

        let reverse_zone = Self::reverse_zone(config, addr);
        let reverse_name = Self::reverse_name(addr);
        let mut reverse = UpdateMessage::new(rand::random(), &reverse_zone);
        reverse.delete_ptr_any(&reverse_name);
        reverse.add_ptr(&reverse_name, config.ttl, &fqdn);
        let outcome = self.send(config, reverse).await;
        self.record(config, &reverse_name, "PTR", addr, &outcome).await;
    }

    /// Removes both records on RELEASE or administrative delete.
    pub async fn withdraw(&self, config: &DdnsConfig, hostname: &str, addr: Ipv4Addr) {
        let fqdn = Self::fqdn(hostname, &config.forward_zone);

        let mut forward = UpdateMessage::new(rand::random(), &config.forward_zone);
        forward.delete_a(&fqdn, addr);
        let outcome = self.send(config, forward).await;
        self.record(config, &fqdn, "A", addr, &outcome).await;

        let reverse_zone = Self::reverse_zone(config, addr);
        let reverse_name = Self::reverse_name(addr);
        let mut reverse = UpdateMessage::new(rand::random(), &reverse_zone);
        reverse.delete_ptr_any(&reverse_name);
        let outcome = self.send(config, reverse).await;
        self.record(config, &reverse_name, "PTR", addr, &outcome).await;
    }

    fn key(config: &DdnsConfig) -> Result<Option<TsigKey>, DdnsError> {
        match (&config.key_name, &config.key_secret, &config.key_algorithm) {
            (Some(name), Some(secret), Some(algorithm)) => {
                TsigKey::from_config(name, secret, algorithm).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn send(
        &self,
        config: &DdnsConfig,
        mut message: UpdateMessage,
    ) -> Result<Rcode, DdnsError> {
        if let Some(key) = Self::key(config)? {
            tsig::sign(&mut message, &key, Utc::now().timestamp() as u64);
        }
        let bytes = message.to_bytes();

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let target = SocketAddr::from((config.server, config.port));
        timeout(DNS_IO_TIMEOUT, socket.send_to(&bytes, target))
            .await
            .map_err(|_| DdnsError::Timeout)??;

        let mut buf = [0u8; 512];
        let (len, _) = timeout(DNS_IO_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DdnsError::Timeout)??;

        let rcode = response_rcode(&buf[..len]).unwrap_or(Rcode::Other(0xFF));
        if rcode.is_success() {
            Ok(rcode)
        } else {
            Err(DdnsError::Rcode(rcode))
        }
    }

    async fn record(
        &self,
        config: &DdnsConfig,
        fqdn: &str,
        record_type: &'static str,
        addr: Ipv4Addr,
        outcome: &Result<Rcode, DdnsError>,
    ) {
        match outcome {
            Ok(_) => log::info!("ddns {} {} -> {} ok", record_type, fqdn, addr),
            Err(e) => log::warn!("ddns {} {} -> {} failed: {}", record_type, fqdn, addr, e),
        }

        let Some(db) = &self.db else { return };
        let entry = DdnsLogEntry {
            config_id: config.id,
            fqdn: fqdn.to_string(),
            record_type,
            address: addr,
            success: outcome.is_ok(),
            detail: match outcome {
                Ok(rcode) => rcode.to_string(),
                Err(e) => e.to_string(),
            },
            at: Utc::now(),
        };
        let db = db.clone();
        let logged =
            tokio::task::spawn_blocking(move || db.insert_ddns_log(&entry)).await;
        match logged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("ddns_log insert failed: {}", e),
            Err(e) => log::warn!("ddns_log insert task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_appends_the_zone_once() {
        assert_eq!(DdnsUpdater::fqdn("alice", "lab.example."), "alice.lab.example.");
        assert_eq!(
            DdnsUpdater::fqdn("alice.lab.example.", "lab.example."),
            "alice.lab.example."
        );
        assert_eq!(
            DdnsUpdater::fqdn("Alice.LAB.example", "lab.example"),
            "Alice.LAB.example."
        );
    }

    #[test]
    fn reverse_names_flip_the_octets() {
        let addr: Ipv4Addr = "10.0.0.100".parse().unwrap();
        assert_eq!(DdnsUpdater::reverse_name(addr), "100.0.0.10.in-addr.arpa.");
    }

    #[test]
    fn reverse_zone_is_derived_when_absent() {
        let config = DdnsConfig {
            id: 1,
            subnet_id: None,
            forward_zone: String::from("lab.example."),
            reverse_zone: None,
            server: "192.0.2.53".parse().unwrap(),
            port: 53,
            key_name: None,
            key_secret: None,
            key_algorithm: None,
            ttl: 300,
            override_client_update: false,
            enabled: true,
        };
        let addr: Ipv4Addr = "10.20.30.40".parse().unwrap();
        assert_eq!(DdnsUpdater::reverse_zone(&config, addr), "30.20.10.in-addr.arpa");

        let configured = DdnsConfig {
            reverse_zone: Some(String::from("20.10.in-addr.arpa")),
            ..config
        };
        assert_eq!(
            DdnsUpdater::reverse_zone(&configured, addr),
            "20.10.in-addr.arpa"
        );
    }
}
