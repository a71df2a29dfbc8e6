//! Administrative records served by the configuration index.
//!
//! Subnets, pools, exclusions, classes, reservations, DDNS configs and
//! the failover peer are plain records related by id; the admin UI
//! writes these tables and the server only ever reads them. Address
//! columns are stored as text and parsed on load.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use mysql::prelude::FromRow;
use mysql::{FromRowError, Row};

use crate::core::packet::HardwareAddress;

#[derive(Debug, Clone)]
pub struct Subnet {
    pub id: u32,
    pub name: String,
    pub network: Ipv4Net,
    pub router: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub wins_servers: Vec<Ipv4Addr>,
    pub default_lease_secs: u32,
    pub max_lease_secs: u32,
    pub mtu: Option<u16>,
    pub tftp_server: Option<String>,
    pub boot_filename: Option<String>,
    pub boot_filename_uefi: Option<String>,
    pub domain_search: Vec<String>,
    pub static_routes: Vec<(Ipv4Addr, u8, Ipv4Addr)>,
    pub time_offset: Option<i32>,
    pub timezone: Option<String>,
    pub interface_name: Option<String>,
    pub enabled: bool,
}

impl Subnet {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr)
    }

    pub fn mask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    /// Configured broadcast, or the one implied by the CIDR.
    pub fn broadcast_addr(&self) -> Ipv4Addr {
        self.broadcast.unwrap_or_else(|| self.network.broadcast())
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub id: u32,
    pub subnet_id: u32,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    /// Lower wins when several pools are eligible.
    pub priority: u32,
    pub allow_unknown_clients: bool,
    pub deny_bootp: bool,
    pub known_clients_only: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Exclusion {
    pub subnet_id: u32,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Exclusion {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        u32::from(self.start) <= addr && addr <= u32::from(self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMatchType {
    /// Substring of option 60.
    VendorClass,
    /// Canonical-text prefix of the hardware address.
    MacPrefix,
    /// Substring of option 12.
    Hostname,
}

impl ClassMatchType {
    fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "vendor" | "vendor_class" => Some(Self::VendorClass),
            "mac" | "mac_prefix" => Some(Self::MacPrefix),
            "hostname" => Some(Self::Hostname),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientClass {
    pub id: u32,
    pub name: String,
    pub match_type: ClassMatchType,
    pub match_value: String,
    pub priority: u32,
    pub boot_filename: Option<String>,
    pub next_server: Option<String>,
    pub enabled: bool,
}

impl ClientClass {
    /// All rules compare case-insensitively.
    pub fn matches(
        &self,
        vendor_class: Option<&str>,
        hw: &HardwareAddress,
        hostname: Option<&str>,
    ) -> bool {
        let needle = self.match_value.to_ascii_lowercase();
        match self.match_type {
            ClassMatchType::VendorClass => vendor_class
                .map(|v| v.to_ascii_lowercase().contains(&needle))
                .unwrap_or(false),
            ClassMatchType::MacPrefix => hw
                .to_string()
                .to_ascii_lowercase()
                .starts_with(&needle),
            ClassMatchType::Hostname => hostname
                .map(|h| h.to_ascii_lowercase().contains(&needle))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub hardware_address: HardwareAddress,
    pub ip_address: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct DdnsConfig {
    pub id: u32,
    /// `None` is the global default, overridden by per-subnet rows.
    pub subnet_id: Option<u32>,
    pub forward_zone: String,
    /// `None` derives `<b3>.<b2>.<b1>.in-addr.arpa` from the address.
    pub reverse_zone: Option<String>,
    pub server: Ipv4Addr,
    pub port: u16,
    pub key_name: Option<String>,
    pub key_secret: Option<String>,
    pub key_algorithm: Option<String>,
    pub ttl: u32,
    pub override_client_update: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverRole {
    Primary,
    Secondary,
}

impl FailoverRole {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }

    pub fn wire(&self) -> u8 {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverPeerConfig {
    pub id: u32,
    pub name: String,
    pub role: FailoverRole,
    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub mclt_secs: u32,
    /// Clients whose hash lands below this byte belong to the primary.
    pub split: u8,
    pub max_response_delay_secs: u32,
    pub max_unacked_updates: u32,
    /// 0 disables automatic PartnerDown.
    pub auto_partner_down_secs: u32,
    pub shared_secret: String,
    pub enabled: bool,
}

// --- row mapping -------------------------------------------------------

fn text(row: &Row, col: &str) -> Option<String> {
    row.get::<Option<String>, _>(col).flatten()
}

fn addr(row: &Row, col: &str) -> Option<Ipv4Addr> {
    text(row, col).and_then(|v| v.parse().ok())
}

fn addr_list(row: &Row, col: &str) -> Vec<Ipv4Addr> {
    text(row, col)
        .map(|v| {
            v.split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn text_list(row: &Row, col: &str) -> Vec<String> {
    text(row, col)
        .map(|v| {
            v.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `dest/prefix>router` entries separated by commas.
fn route_list(row: &Row, col: &str) -> Vec<(Ipv4Addr, u8, Ipv4Addr)> {
    text(row, col)
        .map(|v| {
            v.split(',')
                .filter_map(|part| {
                    let (dest, router) = part.trim().split_once('>')?;
                    let net: Ipv4Net = dest.trim().parse().ok()?;
                    let router: Ipv4Addr = router.trim().parse().ok()?;
                    Some((net.network(), net.prefix_len(), router))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl FromRow for Subnet {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(Subnet {
                id: row.get("id")?,
                name: row.get("name")?,
                network: text(&row, "network")?.parse().ok()?,
                router: addr(&row, "router"),
                broadcast: addr(&row, "broadcast"),
                domain_name: text(&row, "domain_name"),
                dns_servers: addr_list(&row, "dns_servers"),
                ntp_servers: addr_list(&row, "ntp_servers"),
                wins_servers: addr_list(&row, "wins_servers"),
                default_lease_secs: row.get("default_lease_secs")?,
                max_lease_secs: row.get("max_lease_secs")?,
                mtu: row.get::<Option<u16>, _>("mtu")?,
                tftp_server: text(&row, "tftp_server"),
                boot_filename: text(&row, "boot_filename"),
                boot_filename_uefi: text(&row, "boot_filename_uefi"),
                domain_search: text_list(&row, "domain_search"),
                static_routes: route_list(&row, "static_routes"),
                time_offset: row.get::<Option<i32>, _>("time_offset")?,
                timezone: text(&row, "timezone"),
                interface_name: text(&row, "interface_name"),
                enabled: row.get("enabled")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

impl FromRow for Pool {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(Pool {
                id: row.get("id")?,
                subnet_id: row.get("subnet_id")?,
                range_start: addr(&row, "range_start")?,
                range_end: addr(&row, "range_end")?,
                priority: row.get("priority")?,
                allow_unknown_clients: row.get("allow_unknown_clients")?,
                deny_bootp: row.get("deny_bootp")?,
                known_clients_only: row.get("known_clients_only")?,
                enabled: row.get("enabled")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

impl FromRow for Exclusion {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(Exclusion {
                subnet_id: row.get("subnet_id")?,
                start: addr(&row, "range_start")?,
                end: addr(&row, "range_end")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

impl FromRow for ClientClass {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(ClientClass {
                id: row.get("id")?,
                name: row.get("name")?,
                match_type: ClassMatchType::parse(&text(&row, "match_type")?)?,
                match_value: row.get("match_value")?,
                priority: row.get("priority")?,
                boot_filename: text(&row, "boot_filename"),
                next_server: text(&row, "next_server"),
                enabled: row.get("enabled")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

impl FromRow for Reservation {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(Reservation {
                hardware_address: HardwareAddress::parse(&text(
                    &row,
                    "hardware_address",
                )?)?,
                ip_address: addr(&row, "ip_address")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

impl FromRow for DdnsConfig {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(DdnsConfig {
                id: row.get("id")?,
                subnet_id: row.get::<Option<u32>, _>("subnet_id")?,
                forward_zone: row.get("forward_zone")?,
                reverse_zone: text(&row, "reverse_zone"),
                server: addr(&row, "dns_server")?,
                port: row.get("dns_port")?,
                key_name: text(&row, "key_name"),
                key_secret: text(&row, "key_secret"),
                key_algorithm: text(&row, "key_algorithm"),
                ttl: row.get("ttl")?,
                override_client_update: row.get("override_client_update")?,
                enabled: row.get("enabled")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

impl FromRow for FailoverPeerConfig {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            Some(FailoverPeerConfig {
                id: row.get("id")?,
                name: row.get("name")?,
                role: FailoverRole::parse(&text(&row, "role")?)?,
                peer_addr: addr(&row, "peer_address")?,
                peer_port: row.get("peer_port")?,
                local_addr: addr(&row, "local_address")?,
                local_port: row.get("local_port")?,
                mclt_secs: row.get("mclt_secs")?,
                split: row.get("split")?,
                max_response_delay_secs: row.get("max_response_delay_secs")?,
                max_unacked_updates: row.get("max_unacked_updates")?,
                auto_partner_down_secs: row.get("auto_partner_down_secs")?,
                shared_secret: row.get("shared_secret")?,
                enabled: row.get("enabled")?,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_rules_are_case_insensitive() {
        let class = ClientClass {
            id: 1,
            name: String::from("pxe"),
            match_type: ClassMatchType::VendorClass,
            match_value: String::from("pxeclient"),
            priority: 10,
            boot_filename: None,
            next_server: None,
            enabled: true,
        };
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
        assert!(class.matches(Some("PXEClient:Arch:00007"), &hw, None));
        assert!(!class.matches(Some("MSFT 5.0"), &hw, None));
        assert!(!class.matches(None, &hw, None));
    }

    #[test]
    fn mac_prefix_matches_canonical_text() {
        let class = ClientClass {
            id: 2,
            name: String::from("printers"),
            match_type: ClassMatchType::MacPrefix,
            match_value: String::from("aa:bb"),
            priority: 5,
            boot_filename: None,
            next_server: None,
            enabled: true,
        };
        let hw = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, 1]);
        let other = HardwareAddress::new([0x00, 0xBB, 0xCC, 0, 0, 1]);
        assert!(class.matches(None, &hw, None));
        assert!(!class.matches(None, &other, None));
    }

    #[test]
    fn exclusion_range_is_inclusive() {
        let excl = Exclusion {
            subnet_id: 1,
            start: "10.0.0.5".parse().unwrap(),
            end: "10.0.0.9".parse().unwrap(),
        };
        assert!(excl.contains("10.0.0.5".parse().unwrap()));
        assert!(excl.contains("10.0.0.9".parse().unwrap()));
        assert!(!excl.contains("10.0.0.10".parse().unwrap()));
    }
}
