//! Address selection for a subnet.
//!
//! Reservation first, then the client's existing lease, then a walk
//! over the subnet's pools in priority order. The walk is fully
//! deterministic: identical configuration and lease state yield the
//! same address for the same client.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::config::index::Snapshot;
use crate::config::model::{ClientClass, Subnet};

use super::leases::LeaseStore;
use super::packet::HardwareAddress;

/// What the allocator needs to know about the request.
#[derive(Debug)]
pub struct AllocRequest<'a> {
    pub hw: HardwareAddress,
    pub requested: Option<Ipv4Addr>,
    pub is_bootp: bool,
    pub class: Option<&'a ClientClass>,
}

/// Picks an address for the client, or `None` when every eligible
/// pool is exhausted (silence for DISCOVER, NAK for REQUEST).
pub fn allocate(
    snapshot: &Snapshot,
    subnet: &Subnet,
    store: &LeaseStore,
    request: &AllocRequest<'_>,
    now: DateTime<Utc>,
) -> Option<Ipv4Addr> {
    // A reservation always wins, even outside every pool.
    if let Some(reserved) = snapshot.reservation_for(&request.hw) {
        return Some(reserved);
    }

    // Sticky renewal: give the client back what it already holds.
    let prior = store.lookup_by_hw(&request.hw);
    if let Some(lease) = &prior {
        if lease.is_active(now) {
            return Some(lease.ip_address);
        }
    }

    let known = prior.is_some();
    let exclusions = snapshot.exclusions_for(subnet.id);

    for pool in snapshot.pools_for(subnet.id) {
        if pool.deny_bootp && request.is_bootp {
            continue;
        }
        if pool.known_clients_only && !known {
            continue;
        }
        if !pool.allow_unknown_clients && request.class.is_none() {
            continue;
        }

        let start = u32::from(pool.range_start);
        let end = u32::from(pool.range_end);
        for raw in start..=end {
            let candidate = Ipv4Addr::from(raw);
            if exclusions.iter().any(|e| e.contains(candidate)) {
                continue;
            }
            if store.is_declined(candidate, now) {
                continue;
            }
            if let Some(holder) = store.lookup_by_ip(candidate) {
                if holder.hardware_address != request.hw && holder.is_active(now) {
                    continue;
                }
            }
            if let Some(owner) = snapshot.reservation_holder(candidate) {
                if owner != request.hw {
                    continue;
                }
            }
            return Some(candidate);
        }
    }
    None
}
