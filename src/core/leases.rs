//! Write-through lease store.
//!
//! Two concurrent indexes hold immutable lease records: by hardware
//! address (the primary key) and by assigned address. Mutations hit
//! memory synchronously and enqueue a [`WriteOp`] for the batch
//! writer, which commits groups of operations inside one MySQL
//! transaction. Persistence is best-effort: on commit failure the
//! in-memory state stands and the batch is retried, never rolled
//! back — the failover peer and DDNS are additional durability
//! layers.
//!
//! During an address change the two indexes can briefly disagree
//! (the old by-address entry is removed before the new one lands).
//! Readers tolerate that window; allocation and renewal both query
//! by hardware address first.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use mysql::prelude::FromRow;
use mysql::{FromRowError, Row};
use nohash_hasher::BuildNoHashHasher;
use tokio::sync::{mpsc, watch};

use crate::utils::data::DbManager;

use super::packet::HardwareAddress;

/// Declined addresses stay quarantined this many seconds.
pub const DECLINE_QUARANTINE_SECS: i64 = 3600;
/// Capacity of the write-op channel; callers block when it fills.
pub const WRITE_CHANNEL_CAPACITY: usize = 10_000;
/// A batch commits after this many ops or [`BATCH_LINGER_MS`].
pub const BATCH_MAX_OPS: usize = 100;
pub const BATCH_LINGER_MS: u64 = 100;
/// Cadence of the in-memory expiry sweep.
pub const EXPIRY_SWEEP_SECS: u64 = 60;

const COMMIT_RETRIES: u32 = 5;
const COMMIT_RETRY_DELAY_MS: u64 = 500;

/// One lease binding. Records are immutable values; an update
/// replaces the whole entry in both indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseV4 {
    pub hardware_address: HardwareAddress,
    pub ip_address: Ipv4Addr,
    pub hostname: Option<String>,
    pub start: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    /// True once the batch writer has confirmed this exact record.
    pub persisted: bool,
}

impl LeaseV4 {
    pub fn new(
        hardware_address: HardwareAddress,
        ip_address: Ipv4Addr,
        hostname: Option<String>,
        start: DateTime<Utc>,
        expiration: DateTime<Utc>,
    ) -> Self {
        Self {
            hardware_address,
            ip_address,
            hostname,
            start,
            expiration,
            persisted: false,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiration > now
    }
}

impl FromRow for LeaseV4 {
    fn from_row_opt(row: Row) -> Result<Self, FromRowError> {
        let parsed = (|| {
            let hw: String = row.get("hardware_address")?;
            let ip: String = row.get("ip_address")?;
            let start: String = row.get("start")?;
            let expiration: String = row.get("expiration")?;
            Some(LeaseV4 {
                hardware_address: HardwareAddress::parse(&hw)?,
                ip_address: ip.parse().ok()?,
                hostname: row.get::<Option<String>, _>("hostname")?,
                start: DateTime::parse_from_rfc3339(&start).ok()?.with_timezone(&Utc),
                expiration: DateTime::parse_from_rfc3339(&expiration)
                    .ok()?
                    .with_timezone(&Utc),
                persisted: true,
            })
        })();
        parsed.ok_or_else(|| FromRowError(row))
    }
}

/// Persistence operation, applied in submission order per hardware
/// address.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Upsert(LeaseV4),
    DeleteByHw(HardwareAddress),
    DeleteByAddr(Ipv4Addr),
}

/// Read-only counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub write_ops: AtomicU64,
    pub batches: AtomicU64,
    pub pending_writes: AtomicI64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Relaxed) as f64;
        let misses = self.misses.load(Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }
}

type AddrMap<V> = DashMap<u32, V, BuildNoHashHasher<u32>>;

pub struct LeaseStore {
    by_hw: DashMap<HardwareAddress, LeaseV4>,
    by_ip: AddrMap<LeaseV4>,
    declined: AddrMap<DateTime<Utc>>,
    writer: Option<mpsc::Sender<WriteOp>>,
    stats: CacheStats,
}

impl LeaseStore {
    pub fn new(writer: Option<mpsc::Sender<WriteOp>>) -> Self {
        Self {
            by_hw: DashMap::new(),
            by_ip: DashMap::with_hasher(BuildNoHashHasher::default()),
            declined: DashMap::with_hasher(BuildNoHashHasher::default()),
            writer,
            stats: CacheStats::default(),
        }
    }

    /// A store with no persistence channel, for tests and tooling.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Loads the surviving rows on startup; both indexes are filled
    /// and every record keeps its persisted flag.
    pub fn warm_up(&self, leases: Vec<LeaseV4>) {
        for lease in leases {
            self.by_ip.insert(u32::from(lease.ip_address), lease.clone());
            self.by_hw.insert(lease.hardware_address, lease);
        }
    }

    pub fn len(&self) -> usize {
        self.by_hw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hw.is_empty()
    }

    pub fn lookup_by_hw(&self, hw: &HardwareAddress) -> Option<LeaseV4> {
        let hit = self.by_hw.get(hw).map(|e| e.clone());
        match hit {
            Some(lease) => {
                self.stats.hits.fetch_add(1, Relaxed);
                Some(lease)
            }
            None => {
                self.stats.misses.fetch_add(1, Relaxed);
                None
            }
        }
    }

    pub fn lookup_by_ip(&self, addr: Ipv4Addr) -> Option<LeaseV4> {
        let hit = self.by_ip.get(&u32::from(addr)).map(|e| e.clone());
        match hit {
            Some(lease) => {
                self.stats.hits.fetch_add(1, Relaxed);
                Some(lease)
            }
            None => {
                self.stats.misses.fetch_add(1, Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces the binding for the record's hardware
    /// address. When the client moves to a new address the stale
    /// by-address entry is dropped first.
    pub async fn upsert(&self, lease: LeaseV4) {
        if let Some(previous) = self.by_hw.get(&lease.hardware_address) {
            let old_addr = previous.ip_address;
            drop(previous);
            if old_addr != lease.ip_address {
                self.by_ip.remove(&u32::from(old_addr));
            }
        }
        self.by_ip.insert(u32::from(lease.ip_address), lease.clone());
        self.by_hw.insert(lease.hardware_address, lease.clone());
        self.enqueue(WriteOp::Upsert(lease)).await;
    }

    pub async fn remove_by_hw(&self, hw: &HardwareAddress) -> Option<LeaseV4> {
        let removed = self.by_hw.remove(hw).map(|(_, lease)| lease);
        if let Some(lease) = &removed {
            self.by_ip.remove(&u32::from(lease.ip_address));
            self.enqueue(WriteOp::DeleteByHw(*hw)).await;
        }
        removed
    }

    pub async fn remove_by_addr(&self, addr: Ipv4Addr) -> Option<LeaseV4> {
        let removed = self.by_ip.remove(&u32::from(addr)).map(|(_, lease)| lease);
        if let Some(lease) = &removed {
            self.by_hw.remove(&lease.hardware_address);
            self.enqueue(WriteOp::DeleteByAddr(addr)).await;
        }
        removed
    }

    /// DECLINE handling: the address goes into quarantine and any
    /// lease sitting on it is dropped.
    pub async fn mark_declined(&self, addr: Ipv4Addr, now: DateTime<Utc>) {
        self.declined
            .insert(u32::from(addr), now + Duration::seconds(DECLINE_QUARANTINE_SECS));
        self.remove_by_addr(addr).await;
    }

    pub fn is_declined(&self, addr: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.declined
            .get(&u32::from(addr))
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    pub fn clear_declined(&self, addr: Ipv4Addr) {
        self.declined.remove(&u32::from(addr));
    }

    /// Drops expired leases from both indexes and reconsiders
    /// quarantined addresses whose timer elapsed. Does not touch the
    /// database; row expiry is a database maintenance concern.
    pub fn sweep(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut expired = Vec::new();
        for entry in self.by_hw.iter() {
            if !entry.is_active(now) {
                expired.push((*entry.key(), entry.ip_address));
            }
        }
        for (hw, addr) in &expired {
            self.by_hw.remove(hw);
            self.by_ip.remove(&u32::from(*addr));
        }

        let before = self.declined.len();
        self.declined.retain(|_, until| *until > now);
        (expired.len(), before - self.declined.len())
    }

    /// Every binding still live at `now`, for full resync streaming.
    pub fn active_leases(&self, now: DateTime<Utc>) -> Vec<LeaseV4> {
        self.by_hw
            .iter()
            .filter(|e| e.is_active(now))
            .map(|e| e.clone())
            .collect()
    }

    /// Called by the batch writer after a commit: entries still in
    /// memory with matching timestamps gain the persisted flag.
    pub fn confirm_persisted(&self, ops: &[WriteOp]) {
        for op in ops {
            let WriteOp::Upsert(lease) = op else { continue };
            if let Some(mut entry) = self.by_hw.get_mut(&lease.hardware_address) {
                if entry.ip_address == lease.ip_address
                    && entry.expiration == lease.expiration
                {
                    entry.persisted = true;
                }
            }
            if let Some(mut entry) = self.by_ip.get_mut(&u32::from(lease.ip_address)) {
                if entry.hardware_address == lease.hardware_address
                    && entry.expiration == lease.expiration
                {
                    entry.persisted = true;
                }
            }
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    async fn enqueue(&self, op: WriteOp) {
        let Some(writer) = &self.writer else { return };
        self.stats.write_ops.fetch_add(1, Relaxed);
        self.stats.pending_writes.fetch_add(1, Relaxed);
        if writer.send(op).await.is_err() {
            self.stats.pending_writes.fetch_sub(1, Relaxed);
            log::error!("lease write channel closed; memory and database are diverging");
        }
    }
}

/// The single consumer of the write channel. Collects up to
/// [`BATCH_MAX_OPS`] operations or waits [`BATCH_LINGER_MS`], then
/// commits the batch in one transaction. Submission order is
/// preserved, which keeps writes ordered per hardware address.
pub async fn run_batch_writer(
    db: Arc<DbManager>,
    mut rx: mpsc::Receiver<WriteOp>,
    store: Arc<LeaseStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("lease batch writer started");
    loop {
        let first = if *shutdown.borrow() {
            // The dispatcher may still be draining its queue; keep
            // committing until the channel goes quiet.
            match tokio::time::timeout(
                std::time::Duration::from_millis(500),
                rx.recv(),
            )
            .await
            {
                Ok(op) => op,
                Err(_) => None,
            }
        } else {
            tokio::select! {
                op = rx.recv() => op,
                _ = shutdown.changed() => continue,
            }
        };
        let Some(first) = first else { break };

        let mut batch = vec![first];
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(BATCH_LINGER_MS);
        while batch.len() < BATCH_MAX_OPS {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(op) => batch.push(op),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        commit_with_retry(&db, &store, batch).await;
    }
    log::info!("lease batch writer stopped");
}

async fn commit_with_retry(db: &Arc<DbManager>, store: &Arc<LeaseStore>, batch: Vec<WriteOp>) {
    let len = batch.len() as i64;
    for attempt in 1..=COMMIT_RETRIES {
        let db = db.clone();
        let ops = batch.clone();
        let committed =
            tokio::task::spawn_blocking(move || db.commit_lease_batch(&ops)).await;
        match committed {
            Ok(Ok(())) => {
                store.confirm_persisted(&batch);
                store.stats().batches.fetch_add(1, Relaxed);
                store.stats().pending_writes.fetch_sub(len, Relaxed);
                return;
            }
            Ok(Err(e)) => {
                log::warn!(
                    "lease batch commit failed (attempt {}/{}): {}",
                    attempt,
                    COMMIT_RETRIES,
                    e
                );
            }
            Err(e) => {
                log::warn!("lease batch commit task failed: {}", e);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(
            COMMIT_RETRY_DELAY_MS * attempt as u64,
        ))
        .await;
    }
    // Memory keeps the state; the peer and DDNS carry the rest.
    store.stats().pending_writes.fetch_sub(len, Relaxed);
    log::error!("dropping lease batch of {} ops after {} attempts", len, COMMIT_RETRIES);
}

/// Periodic in-memory maintenance: expiry sweep, quarantine
/// reconsideration and a stats line.
pub async fn run_expiry_sweep(store: Arc<LeaseStore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(EXPIRY_SWEEP_SECS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let (expired, reconsidered) = store.sweep(Utc::now());
        if expired > 0 || reconsidered > 0 {
            log::info!(
                "sweep: {} leases expired, {} addresses out of quarantine",
                expired,
                reconsidered
            );
        }
        let stats = store.stats();
        log::debug!(
            "lease cache: {} entries, hit ratio {:.2}, {} write ops in {} batches, {} pending",
            store.len(),
            stats.hit_ratio(),
            stats.write_ops.load(Relaxed),
            stats.batches.load(Relaxed),
            stats.pending_writes.load(Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(last: u8) -> HardwareAddress {
        HardwareAddress::new([0xAA, 0xBB, 0xCC, 0, 0, last])
    }

    fn lease(last: u8, addr: &str, ttl_secs: i64) -> LeaseV4 {
        let now = Utc::now();
        LeaseV4::new(
            hw(last),
            addr.parse().unwrap(),
            None,
            now,
            now + Duration::seconds(ttl_secs),
        )
    }

    #[tokio::test]
    async fn upsert_fills_both_indexes() {
        let store = LeaseStore::in_memory();
        store.upsert(lease(1, "10.0.0.100", 3600)).await;

        let by_hw = store.lookup_by_hw(&hw(1)).unwrap();
        assert_eq!(by_hw.ip_address, "10.0.0.100".parse::<Ipv4Addr>().unwrap());
        let by_ip = store.lookup_by_ip("10.0.0.100".parse().unwrap()).unwrap();
        assert_eq!(by_ip.hardware_address, hw(1));
    }

    #[tokio::test]
    async fn address_change_evicts_the_old_index_entry() {
        let store = LeaseStore::in_memory();
        store.upsert(lease(1, "10.0.0.100", 3600)).await;
        store.upsert(lease(1, "10.0.0.101", 3600)).await;

        assert!(store.lookup_by_ip("10.0.0.100".parse().unwrap()).is_none());
        assert_eq!(
            store.lookup_by_ip("10.0.0.101".parse().unwrap()).unwrap().hardware_address,
            hw(1)
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn decline_quarantines_and_drops_the_lease() {
        let store = LeaseStore::in_memory();
        let now = Utc::now();
        store.upsert(lease(1, "10.0.0.100", 3600)).await;
        store.mark_declined("10.0.0.100".parse().unwrap(), now).await;

        assert!(store.is_declined("10.0.0.100".parse().unwrap(), now));
        assert!(store.lookup_by_hw(&hw(1)).is_none());
        // The quarantine lapses after an hour.
        assert!(!store.is_declined(
            "10.0.0.100".parse().unwrap(),
            now + Duration::seconds(3601)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_reconsiders() {
        let store = LeaseStore::in_memory();
        let now = Utc::now();
        store.upsert(lease(1, "10.0.0.100", -5)).await;
        store.upsert(lease(2, "10.0.0.101", 3600)).await;
        store
            .mark_declined(
                "10.0.0.102".parse().unwrap(),
                now - Duration::seconds(2 * DECLINE_QUARANTINE_SECS),
            )
            .await;

        let (expired, reconsidered) = store.sweep(now);
        assert_eq!(expired, 1);
        assert_eq!(reconsidered, 1);
        assert!(store.lookup_by_hw(&hw(1)).is_none());
        assert!(store.lookup_by_hw(&hw(2)).is_some());
    }

    #[tokio::test]
    async fn confirm_persisted_requires_matching_timestamps() {
        let store = LeaseStore::in_memory();
        let original = lease(1, "10.0.0.100", 3600);
        store.upsert(original.clone()).await;
        // The client renewed while the batch was in flight.
        let renewed = LeaseV4 {
            expiration: original.expiration + Duration::seconds(600),
            ..original.clone()
        };
        store.upsert(renewed).await;

        store.confirm_persisted(&[WriteOp::Upsert(original)]);
        assert!(!store.lookup_by_hw(&hw(1)).unwrap().persisted);
    }

    #[test]
    fn write_ops_are_counted() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            let store = LeaseStore::new(Some(tx));
            store.upsert(lease(1, "10.0.0.100", 3600)).await;
            store.remove_by_hw(&hw(1)).await;

            assert_eq!(store.stats().write_ops.load(Relaxed), 2);
            assert!(matches!(rx.recv().await, Some(WriteOp::Upsert(_))));
            assert!(matches!(rx.recv().await, Some(WriteOp::DeleteByHw(_))));
        });
    }
}
