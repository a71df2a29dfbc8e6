//! MySQL adapter: the only place that speaks SQL.
//!
//! The rest of the core goes through these typed operations; the
//! exact schema belongs to the administrative surface, which writes
//! the configuration tables this module only reads. Lease writes
//! arrive pre-batched from the lease store's writer task and commit
//! inside one transaction.

use chrono::Utc;
use mysql::prelude::Queryable;
use mysql::{params, Opts, Pool, TxOpts};

use crate::config::model::{
    ClientClass, DdnsConfig, Exclusion, FailoverPeerConfig, Pool as AddressPool, Reservation,
    Subnet,
};
use crate::core::leases::{LeaseV4, WriteOp};
use crate::core::packet::HardwareAddress;
use crate::ddns::client::DdnsLogEntry;
use crate::failover::state::FailoverState;

pub struct DbManager {
    pool: Pool,
}

impl DbManager {
    pub fn connect(url: &str) -> Result<Self, mysql::Error> {
        let opts = Opts::from_url(url)?;
        Ok(Self {
            pool: Pool::new(opts)?,
        })
    }

    // --- leases -------------------------------------------------------

    /// Rows still alive, for the startup warm-up.
    pub fn load_active_leases(&self) -> Result<Vec<LeaseV4>, mysql::Error> {
        self.pool.get_conn()?.exec(
            "SELECT hardware_address, ip_address, hostname, start, expiration \
             FROM leases WHERE expiration > :now",
            params! { "now" => Utc::now().to_rfc3339() },
        )
    }

    pub fn select_lease_by_hw(
        &self,
        hw: &HardwareAddress,
    ) -> Result<Option<LeaseV4>, mysql::Error> {
        self.pool.get_conn()?.exec_first(
            "SELECT hardware_address, ip_address, hostname, start, expiration \
             FROM leases WHERE hardware_address = :hw",
            params! { "hw" => hw.to_string() },
        )
    }

    /// Applies a batch in submission order inside one transaction.
    pub fn commit_lease_batch(&self, ops: &[WriteOp]) -> Result<(), mysql::Error> {
        let mut conn = self.pool.get_conn()?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        for op in ops {
            match op {
                WriteOp::Upsert(lease) => tx.exec_drop(
                    "INSERT INTO leases \
                     (hardware_address, ip_address, hostname, start, expiration) \
                     VALUES (:hw, :ip, :hostname, :start, :expiration) \
                     ON DUPLICATE KEY UPDATE ip_address = :ip, hostname = :hostname, \
                     start = :start, expiration = :expiration",
                    params! {
                        "hw" => lease.hardware_address.to_string(),
                        "ip" => lease.ip_address.to_string(),
                        "hostname" => lease.hostname.clone(),
                        "start" => lease.start.to_rfc3339(),
                        "expiration" => lease.expiration.to_rfc3339(),
                    },
                )?,
                WriteOp::DeleteByHw(hw) => tx.exec_drop(
                    "DELETE FROM leases WHERE hardware_address = :hw",
                    params! { "hw" => hw.to_string() },
                )?,
                WriteOp::DeleteByAddr(addr) => tx.exec_drop(
                    "DELETE FROM leases WHERE ip_address = :ip",
                    params! { "ip" => addr.to_string() },
                )?,
            }
        }
        tx.commit()
    }

    /// Row-level expiry maintenance; the in-memory sweep never
    /// touches the database.
    pub fn delete_expired_leases(&self) -> Result<u64, mysql::Error> {
        let mut conn = self.pool.get_conn()?;
        conn.exec_drop(
            "DELETE FROM leases WHERE expiration <= :now",
            params! { "now" => Utc::now().to_rfc3339() },
        )?;
        Ok(conn.affected_rows())
    }

    // --- configuration ------------------------------------------------

    pub fn load_subnets(&self) -> Result<Vec<Subnet>, mysql::Error> {
        self.pool
            .get_conn()?
            .query("SELECT * FROM subnets WHERE enabled = 1")
    }

    pub fn load_pools(&self) -> Result<Vec<AddressPool>, mysql::Error> {
        self.pool
            .get_conn()?
            .query("SELECT * FROM pools WHERE enabled = 1")
    }

    pub fn load_exclusions(&self) -> Result<Vec<Exclusion>, mysql::Error> {
        self.pool.get_conn()?.query("SELECT * FROM exclusions")
    }

    pub fn load_classes(&self) -> Result<Vec<ClientClass>, mysql::Error> {
        self.pool
            .get_conn()?
            .query("SELECT * FROM classes WHERE enabled = 1")
    }

    pub fn load_reservations(&self) -> Result<Vec<Reservation>, mysql::Error> {
        self.pool
            .get_conn()?
            .query("SELECT * FROM mac_reservations")
    }

    pub fn load_ddns_configs(&self) -> Result<Vec<DdnsConfig>, mysql::Error> {
        self.pool
            .get_conn()?
            .query("SELECT * FROM ddns_configs WHERE enabled = 1")
    }

    // --- ddns log -----------------------------------------------------

    pub fn insert_ddns_log(&self, entry: &DdnsLogEntry) -> Result<(), mysql::Error> {
        self.pool.get_conn()?.exec_drop(
            "INSERT INTO ddns_log \
             (config_id, fqdn, record_type, ip_address, success, detail, created_at) \
             VALUES (:config_id, :fqdn, :record_type, :ip, :success, :detail, :at)",
            params! {
                "config_id" => entry.config_id,
                "fqdn" => entry.fqdn.clone(),
                "record_type" => entry.record_type,
                "ip" => entry.address.to_string(),
                "success" => entry.success,
                "detail" => entry.detail.clone(),
                "at" => entry.at.to_rfc3339(),
            },
        )
    }

    // --- failover -----------------------------------------------------

    pub fn load_failover_peer(&self) -> Result<Option<FailoverPeerConfig>, mysql::Error> {
        self.pool
            .get_conn()?
            .query_first("SELECT * FROM failover_peers WHERE enabled = 1 LIMIT 1")
    }

    pub fn save_failover_state(
        &self,
        peer_id: u32,
        state: FailoverState,
    ) -> Result<(), mysql::Error> {
        self.pool.get_conn()?.exec_drop(
            "INSERT INTO failover_state (peer_id, state, updated_at) \
             VALUES (:peer_id, :state, :at) \
             ON DUPLICATE KEY UPDATE state = :state, updated_at = :at",
            params! {
                "peer_id" => peer_id,
                "state" => state.wire(),
                "at" => Utc::now().to_rfc3339(),
            },
        )
    }
}
