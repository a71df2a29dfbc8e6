//! Refresh-on-demand snapshot of the administrative configuration.
//!
//! A snapshot is immutable once observed: every request works against
//! one `Arc<Snapshot>` for its whole lifetime and the index swaps the
//! arc wholesale on reload. Writers (the admin surface) only flip the
//! staleness flag; the next reader pays for the reload, guarded by a
//! single-flight lock so a thundering herd performs one query burst.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log;

use crate::core::errors::PersistenceError;
use crate::core::packet::HardwareAddress;
use crate::utils::data::DbManager;

use super::model::{ClientClass, DdnsConfig, Exclusion, Pool, Reservation, Subnet};

/// One coherent view of the configuration tables.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub subnets: Vec<Arc<Subnet>>,
    pub pools_by_subnet: HashMap<u32, Vec<Arc<Pool>>>,
    pub exclusions_by_subnet: HashMap<u32, Vec<Exclusion>>,
    pub classes: Vec<Arc<ClientClass>>,
    pub reservations_by_hw: HashMap<HardwareAddress, Ipv4Addr>,
    pub reservations_by_ip: HashMap<u32, HardwareAddress>,
    pub ddns_by_subnet: HashMap<u32, Arc<DdnsConfig>>,
    pub ddns_global: Option<Arc<DdnsConfig>>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Builds the lookup maps from freshly loaded rows. Disabled rows
    /// never enter the snapshot; pools are pre-sorted in allocation
    /// order and classes in match order.
    pub fn assemble(
        subnets: Vec<Subnet>,
        pools: Vec<Pool>,
        exclusions: Vec<Exclusion>,
        classes: Vec<ClientClass>,
        reservations: Vec<Reservation>,
        ddns: Vec<DdnsConfig>,
    ) -> Self {
        let mut subnets: Vec<Arc<Subnet>> = subnets
            .into_iter()
            .filter(|s| s.enabled)
            .map(Arc::new)
            .collect();
        subnets.sort_by(|a, b| a.name.cmp(&b.name));

        let mut pools_by_subnet: HashMap<u32, Vec<Arc<Pool>>> = HashMap::new();
        for pool in pools.into_iter().filter(|p| p.enabled) {
            pools_by_subnet
                .entry(pool.subnet_id)
                .or_default()
                .push(Arc::new(pool));
        }
        for pools in pools_by_subnet.values_mut() {
            pools.sort_by_key(|p| (p.priority, u32::from(p.range_start)));
        }

        let mut exclusions_by_subnet: HashMap<u32, Vec<Exclusion>> = HashMap::new();
        for excl in exclusions {
            exclusions_by_subnet
                .entry(excl.subnet_id)
                .or_default()
                .push(excl);
        }

        let classes: Vec<Arc<ClientClass>> = classes
            .into_iter()
            .filter(|c| c.enabled)
            .sorted_by_key(|c| c.priority)
            .map(Arc::new)
            .collect();

        let mut reservations_by_hw = HashMap::new();
        let mut reservations_by_ip = HashMap::new();
        for r in &reservations {
            reservations_by_hw.insert(r.hardware_address, r.ip_address);
            reservations_by_ip.insert(u32::from(r.ip_address), r.hardware_address);
        }

        let mut ddns_by_subnet = HashMap::new();
        let mut ddns_global = None;
        for cfg in ddns.into_iter().filter(|c| c.enabled) {
            let cfg = Arc::new(cfg);
            match cfg.subnet_id {
                Some(id) => {
                    ddns_by_subnet.insert(id, cfg);
                }
                None => ddns_global = Some(cfg),
            }
        }

        Self {
            subnets,
            pools_by_subnet,
            exclusions_by_subnet,
            classes,
            reservations_by_hw,
            reservations_by_ip,
            ddns_by_subnet,
            ddns_global,
            loaded_at: Some(Utc::now()),
        }
    }

    /// Subnet selection for an incoming request, in fixed precedence:
    /// relay, then client address, then requested address, then the
    /// receiving interface, then the first enabled subnet by name.
    pub fn select_subnet(
        &self,
        giaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
        requested: Option<Ipv4Addr>,
        interface: Option<&str>,
    ) -> Option<&Arc<Subnet>> {
        if !giaddr.is_unspecified() {
            return self.subnets.iter().find(|s| s.contains(giaddr));
        }
        if !ciaddr.is_unspecified() {
            if let Some(subnet) = self.subnets.iter().find(|s| s.contains(ciaddr)) {
                return Some(subnet);
            }
        }
        if let Some(requested) = requested {
            if let Some(subnet) = self.subnets.iter().find(|s| s.contains(requested)) {
                return Some(subnet);
            }
        }
        if let Some(interface) = interface {
            let hit = self.subnets.iter().find(|s| {
                s.interface_name
                    .as_deref()
                    .map(|name| name.eq_ignore_ascii_case(interface))
                    .unwrap_or(false)
            });
            if hit.is_some() {
                return hit;
            }
        }
        self.subnets.first()
    }

    /// First enabled class (ascending priority) whose rule matches; at
    /// most one class applies per request.
    pub fn match_class(
        &self,
        vendor_class: Option<&str>,
        hw: &HardwareAddress,
        hostname: Option<&str>,
    ) -> Option<&Arc<ClientClass>> {
        self.classes
            .iter()
            .find(|c| c.matches(vendor_class, hw, hostname))
    }

    pub fn reservation_for(&self, hw: &HardwareAddress) -> Option<Ipv4Addr> {
        self.reservations_by_hw.get(hw).copied()
    }

    pub fn reservation_holder(&self, addr: Ipv4Addr) -> Option<HardwareAddress> {
        self.reservations_by_ip.get(&u32::from(addr)).copied()
    }

    pub fn pools_for(&self, subnet_id: u32) -> &[Arc<Pool>] {
        self.pools_by_subnet
            .get(&subnet_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn exclusions_for(&self, subnet_id: u32) -> &[Exclusion] {
        self.exclusions_by_subnet
            .get(&subnet_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Per-subnet DDNS config, falling back to the global row.
    pub fn ddns_for(&self, subnet_id: u32) -> Option<&Arc<DdnsConfig>> {
        self.ddns_by_subnet
            .get(&subnet_id)
            .or(self.ddns_global.as_ref())
    }
}

/// The live index. Readers call [`ConfigIndex::snapshot`]; the admin
/// surface calls [`ConfigIndex::invalidate`] after mutating the
/// tables.
pub struct ConfigIndex {
    current: ArcSwap<Snapshot>,
    stale: AtomicBool,
    reload_gate: tokio::sync::Mutex<()>,
    db: Arc<DbManager>,
}

impl ConfigIndex {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            stale: AtomicBool::new(true),
            reload_gate: tokio::sync::Mutex::new(()),
            db,
        }
    }

    /// Returns the current snapshot, reloading first if a writer
    /// invalidated it. Concurrent readers hitting a stale snapshot
    /// queue on one reload; whoever loses the race finds the flag
    /// already cleared and returns the fresh arc.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        if self.stale.load(Ordering::Acquire) {
            let _flight = self.reload_gate.lock().await;
            if self.stale.load(Ordering::Acquire) {
                match self.reload().await {
                    Ok(()) => self.stale.store(false, Ordering::Release),
                    Err(e) => {
                        // Serve the previous snapshot rather than
                        // stall the pipeline.
                        log::warn!("configuration reload failed: {}", e);
                    }
                }
            }
        }
        self.current.load_full()
    }

    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    async fn reload(&self) -> Result<(), PersistenceError> {
        let db = self.db.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            Ok::<Snapshot, PersistenceError>(Snapshot::assemble(
                db.load_subnets()?,
                db.load_pools()?,
                db.load_exclusions()?,
                db.load_classes()?,
                db.load_reservations()?,
                db.load_ddns_configs()?,
            ))
        })
        .await
        .map_err(|_| PersistenceError::ChannelClosed)??;

        log::info!(
            "configuration reloaded: {} subnets, {} classes, {} reservations",
            snapshot.subnets.len(),
            snapshot.classes.len(),
            snapshot.reservations_by_hw.len()
        );
        self.current.store(Arc::new(snapshot));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::ClassMatchType;

    pub(crate) fn subnet(id: u32, name: &str, cidr: &str, iface: Option<&str>) -> Subnet {
        Subnet {
            id,
            name: name.to_string(),
            network: cidr.parse().unwrap(),
            router: Some("10.0.0.1".parse().unwrap()),
            broadcast: None,
            domain_name: None,
            dns_servers: vec![],
            ntp_servers: vec![],
            wins_servers: vec![],
            default_lease_secs: 3600,
            max_lease_secs: 86400,
            mtu: None,
            tftp_server: None,
            boot_filename: None,
            boot_filename_uefi: None,
            domain_search: vec![],
            static_routes: vec![],
            time_offset: None,
            timezone: None,
            interface_name: iface.map(String::from),
            enabled: true,
        }
    }

    fn snapshot_with(subnets: Vec<Subnet>) -> Snapshot {
        Snapshot::assemble(subnets, vec![], vec![], vec![], vec![], vec![])
    }

    #[test]
    fn giaddr_wins_over_everything() {
        let snap = snapshot_with(vec![
            subnet(1, "a", "10.0.0.0/24", Some("eth0")),
            subnet(2, "b", "10.1.0.0/24", None),
        ]);
        let chosen = snap
            .select_subnet(
                "10.1.0.9".parse().unwrap(),
                "10.0.0.5".parse().unwrap(),
                None,
                Some("eth0"),
            )
            .unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn interface_match_is_case_insensitive() {
        let snap = snapshot_with(vec![
            subnet(1, "a", "10.0.0.0/24", Some("ETH1")),
            subnet(2, "b", "10.1.0.0/24", None),
        ]);
        let chosen = snap
            .select_subnet(
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                None,
                Some("eth1"),
            )
            .unwrap();
        assert_eq!(chosen.id, 1);
    }

    #[test]
    fn falls_back_to_first_by_name() {
        let snap = snapshot_with(vec![
            subnet(7, "zulu", "10.7.0.0/24", None),
            subnet(3, "alpha", "10.3.0.0/24", None),
        ]);
        let chosen = snap
            .select_subnet(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, None, None)
            .unwrap();
        assert_eq!(chosen.id, 3);
    }

    #[test]
    fn lowest_priority_class_wins() {
        let mk = |id, priority, value: &str| ClientClass {
            id,
            name: format!("class-{}", id),
            match_type: ClassMatchType::VendorClass,
            match_value: value.to_string(),
            priority,
            boot_filename: None,
            next_server: None,
            enabled: true,
        };
        let snap = Snapshot::assemble(
            vec![],
            vec![],
            vec![],
            vec![mk(1, 20, "pxe"), mk(2, 10, "client")],
            vec![],
            vec![],
        );
        let hw = HardwareAddress::new([0; 6]);
        let class = snap.match_class(Some("PXEClient"), &hw, None).unwrap();
        assert_eq!(class.id, 2);
    }

    #[test]
    fn pools_sorted_by_priority_then_start() {
        let mk = |id, priority, start: &str| Pool {
            id,
            subnet_id: 1,
            range_start: start.parse().unwrap(),
            range_end: "10.0.0.250".parse().unwrap(),
            priority,
            allow_unknown_clients: true,
            deny_bootp: false,
            known_clients_only: false,
            enabled: true,
        };
        let snap = Snapshot::assemble(
            vec![],
            vec![mk(1, 5, "10.0.0.200"), mk(2, 5, "10.0.0.100"), mk(3, 1, "10.0.0.240")],
            vec![],
            vec![],
            vec![],
            vec![],
        );
        let ids: Vec<u32> = snap.pools_for(1).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }
}
