//! Failover engine: peer session upkeep, load balancing, binding
//! replication and the state machine around connection loss.
//!
//! The primary dials the peer; the secondary listens. Once the
//! CONNECT/CONNECTACK exchange completes both sides are operational
//! and stream binding updates. Losing the channel degrades to
//! CommunicationsInterrupted where each side serves by the split
//! rules, optionally escalating to PartnerDown after the configured
//! grace period.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use nohash_hasher::BuildNoHashHasher;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::config::model::{FailoverPeerConfig, FailoverRole};
use crate::core::leases::{LeaseStore, LeaseV4};
use crate::core::packet::HardwareAddress;
use crate::utils::data::DbManager;

use super::frame::{
    read_frame, write_frame, BindingState, BindingUpdate, FailoverMessage, PROTOCOL_VERSION,
};
use super::state::FailoverState;

pub const HEARTBEAT_SECS: u64 = 10;
/// Unacked updates older than this are written off.
pub const ACK_WINDOW_SECS: i64 = 5;
pub const RECONNECT_BACKOFF_START_SECS: u64 = 5;
const RECONNECT_BACKOFF_MAX_SECS: u64 = 300;
const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Byte-wise hash of the hardware address, the load-balancing key.
pub fn hash_hardware(hw: &HardwareAddress) -> u8 {
    hw.bytes().iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

type AddrMap<V> = DashMap<u32, V, BuildNoHashHasher<u32>>;

struct PendingUpdate {
    address: Ipv4Addr,
    end_time: u32,
    sent_at: DateTime<Utc>,
}

pub struct FailoverEngine {
    config: FailoverPeerConfig,
    state: AtomicU8,
    peer_state: AtomicU8,
    /// Unix seconds of the last frame from the peer.
    last_heard: AtomicI64,
    /// Unix seconds when CommunicationsInterrupted began, 0 if not.
    interrupted_since: AtomicI64,
    next_tx_id: AtomicU32,
    outbound: Mutex<Option<mpsc::Sender<FailoverMessage>>>,
    pending: DashMap<u32, PendingUpdate>,
    /// Last acknowledged end-time per address, the MCLT anchor.
    peer_end_times: AddrMap<u32>,
    store: Arc<LeaseStore>,
    db: Option<Arc<DbManager>>,
}

impl FailoverEngine {
    pub fn new(
        config: FailoverPeerConfig,
        store: Arc<LeaseStore>,
        db: Option<Arc<DbManager>>,
    ) -> Self {
        Self {
            config,
            state: AtomicU8::new(FailoverState::Startup.wire()),
            peer_state: AtomicU8::new(FailoverState::Startup.wire()),
            last_heard: AtomicI64::new(0),
            interrupted_since: AtomicI64::new(0),
            next_tx_id: AtomicU32::new(1),
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            peer_end_times: DashMap::with_hasher(BuildNoHashHasher::default()),
            store,
            db,
        }
    }

    pub fn config(&self) -> &FailoverPeerConfig {
        &self.config
    }

    pub fn state(&self) -> FailoverState {
        FailoverState::from_wire(self.state.load(Ordering::Acquire))
            .unwrap_or(FailoverState::Startup)
    }

    pub fn peer_state(&self) -> FailoverState {
        FailoverState::from_wire(self.peer_state.load(Ordering::Acquire))
            .unwrap_or(FailoverState::Startup)
    }

    fn set_state(&self, new_state: FailoverState) {
        let old = self.state();
        if old == new_state {
            return;
        }
        self.state.store(new_state.wire(), Ordering::Release);
        log::info!("failover state {} -> {}", old, new_state);

        match new_state {
            FailoverState::CommunicationsInterrupted => {
                self.interrupted_since
                    .store(Utc::now().timestamp(), Ordering::Release);
            }
            _ => self.interrupted_since.store(0, Ordering::Release),
        }

        if let Some(db) = &self.db {
            let db = db.clone();
            let peer_id = self.config.id;
            tokio::task::spawn_blocking(move || {
                if let Err(e) = db.save_failover_state(peer_id, new_state) {
                    log::warn!("failed to persist failover state: {}", e);
                }
            });
        }
    }

    pub fn can_serve(&self) -> bool {
        self.state().can_serve()
    }

    /// The load-balancing gate. In Normal the split applies to the
    /// hardware-address hash; once communications are interrupted it
    /// applies to the last octet of the candidate address so both
    /// sides keep handing out disjoint halves of every pool.
    pub fn responsible_for(
        &self,
        hw: &HardwareAddress,
        candidate: Option<Ipv4Addr>,
    ) -> bool {
        match self.state() {
            FailoverState::Normal => {
                let hash = hash_hardware(hw);
                match self.config.role {
                    FailoverRole::Primary => hash < self.config.split,
                    FailoverRole::Secondary => hash >= self.config.split,
                }
            }
            FailoverState::CommunicationsInterrupted => match candidate {
                Some(addr) => {
                    let octet = addr.octets()[3];
                    match self.config.role {
                        FailoverRole::Primary => octet < self.config.split,
                        FailoverRole::Secondary => octet >= self.config.split,
                    }
                }
                None => true,
            },
            FailoverState::PartnerDown => true,
            _ => false,
        }
    }

    /// Caps a proposed expiration by the MCLT rule: never promise
    /// the client more than the peer has acknowledged plus MCLT.
    pub fn cap_expiration(
        &self,
        addr: Ipv4Addr,
        desired: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mclt = Duration::seconds(self.config.mclt_secs as i64);
        let anchor = self
            .peer_end_times
            .get(&u32::from(addr))
            .and_then(|end| Utc.timestamp_opt(*end as i64, 0).single())
            .unwrap_or(now);
        desired.min(anchor + mclt)
    }

    /// Queues a BNDUPD for the peer. Skipped while disconnected or
    /// while too many updates are unacknowledged; UPDREQALL
    /// reconciles on reconnect.
    pub async fn replicate(
        &self,
        hw: HardwareAddress,
        addr: Ipv4Addr,
        binding_state: BindingState,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        let sender = self.outbound.lock().unwrap().clone();
        let Some(sender) = sender else { return };
        if self.pending.len() >= self.config.max_unacked_updates as usize {
            log::warn!(
                "failover: {} unacked updates, not replicating {}",
                self.pending.len(),
                addr
            );
            return;
        }

        let tx_id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        let update = BindingUpdate {
            tx_id,
            address: addr,
            hardware_address: hw,
            state: binding_state,
            start_time: start.timestamp().max(0) as u32,
            end_time: end.timestamp().max(0) as u32,
        };
        self.pending.insert(
            tx_id,
            PendingUpdate {
                address: addr,
                end_time: update.end_time,
                sent_at: Utc::now(),
            },
        );
        if sender.send(FailoverMessage::BndUpd(update)).await.is_err() {
            self.pending.remove(&tx_id);
        }
    }

    pub async fn replicate_lease(&self, lease: &LeaseV4) {
        self.replicate(
            lease.hardware_address,
            lease.ip_address,
            BindingState::Active,
            lease.start,
            lease.expiration,
        )
        .await;
    }

    fn note_ack(&self, tx_id: u32, status: u8) {
        let Some((_, pending)) = self.pending.remove(&tx_id) else {
            return;
        };
        if status == 0 {
            self.peer_end_times
                .insert(u32::from(pending.address), pending.end_time);
        } else {
            log::warn!(
                "failover: peer rejected binding update for {} (status {})",
                pending.address,
                status
            );
        }
    }

    /// Applies an incoming binding idempotently. Stale updates (end
    /// not strictly newer than what we hold) are ignored.
    async fn apply_binding(&self, update: BindingUpdate) {
        match update.state {
            BindingState::Active => {
                let end = Utc
                    .timestamp_opt(update.end_time as i64, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                if let Some(held) = self.store.lookup_by_ip(update.address) {
                    if held.expiration.timestamp() >= update.end_time as i64 {
                        return;
                    }
                }
                let start = Utc
                    .timestamp_opt(update.start_time as i64, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                self.store
                    .upsert(LeaseV4::new(
                        update.hardware_address,
                        update.address,
                        None,
                        start,
                        end,
                    ))
                    .await;
            }
            BindingState::Free
            | BindingState::Released
            | BindingState::Expired
            | BindingState::Reset => {
                self.store.remove_by_addr(update.address).await;
            }
            BindingState::Abandoned => {
                self.store.mark_declined(update.address, Utc::now()).await;
            }
        }
    }

    fn touch(&self) {
        self.last_heard.store(Utc::now().timestamp(), Ordering::Release);
    }

    fn seconds_since_heard(&self) -> i64 {
        let last = self.last_heard.load(Ordering::Acquire);
        if last == 0 {
            0
        } else {
            Utc::now().timestamp() - last
        }
    }

    /// Expires pending updates past the ack window.
    fn sweep_pending(&self) {
        let cutoff = Utc::now() - Duration::seconds(ACK_WINDOW_SECS);
        let before = self.pending.len();
        self.pending.retain(|_, p| p.sent_at > cutoff);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            log::warn!("failover: {} binding updates went unacknowledged", dropped);
        }
    }

    /// While disconnected: escalate CommunicationsInterrupted to
    /// PartnerDown once the configured grace period elapses.
    fn consider_partner_down(&self) {
        if self.config.auto_partner_down_secs == 0 {
            return;
        }
        if self.state() != FailoverState::CommunicationsInterrupted {
            return;
        }
        let since = self.interrupted_since.load(Ordering::Acquire);
        if since == 0 {
            return;
        }
        if Utc::now().timestamp() - since >= self.config.auto_partner_down_secs as i64 {
            log::warn!("failover: partner presumed down, assuming full responsibility");
            self.set_state(FailoverState::PartnerDown);
        }
    }
}

/// Connection upkeep loop: dial or accept, handshake, run the
/// session, degrade and retry with bounded backoff.
pub async fn run(engine: Arc<FailoverEngine>, mut shutdown: watch::Receiver<bool>) {
    let role = engine.config.role;
    let listener = if role == FailoverRole::Secondary {
        let bind = (engine.config.local_addr, engine.config.local_port);
        match TcpListener::bind(bind).await {
            Ok(l) => Some(l),
            Err(e) => {
                log::error!("failover: cannot listen on {}:{}: {}", bind.0, bind.1, e);
                return;
            }
        }
    } else {
        None
    };

    let mut backoff = RECONNECT_BACKOFF_START_SECS;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            stream = establish(&engine, listener.as_ref()) => stream,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(stream) => {
                backoff = RECONNECT_BACKOFF_START_SECS;
                if let Err(e) = session(&engine, stream, &mut shutdown).await {
                    log::warn!("failover session ended: {}", e);
                }
                engine.outbound.lock().unwrap().take();
                if *shutdown.borrow() {
                    break;
                }
                if engine.state() == FailoverState::Normal {
                    engine.set_state(FailoverState::CommunicationsInterrupted);
                }
            }
            Err(e) => {
                log::warn!("failover: cannot reach peer: {}", e);
            }
        }

        // Bounded backoff with a little jitter so both sides do not
        // redial in lockstep.
        let jitter = rand::thread_rng().gen_range(0..1000);
        let wait = std::time::Duration::from_secs(backoff)
            + std::time::Duration::from_millis(jitter);
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        engine.consider_partner_down();
    }

    engine.set_state(FailoverState::Shutdown);
}

async fn establish(
    engine: &FailoverEngine,
    listener: Option<&TcpListener>,
) -> Result<TcpStream, std::io::Error> {
    match listener {
        Some(listener) => {
            let (stream, peer) = listener.accept().await?;
            log::info!("failover: peer connected from {}", peer);
            Ok(stream)
        }
        None => {
            let target = (engine.config.peer_addr, engine.config.peer_port);
            let stream = TcpStream::connect(target).await?;
            log::info!("failover: connected to peer {}:{}", target.0, target.1);
            Ok(stream)
        }
    }
}

async fn session(
    engine: &Arc<FailoverEngine>,
    stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), crate::core::errors::FailoverError> {
    use crate::core::errors::FailoverError;

    let (mut reader, mut writer) = stream.into_split();

    let peer_state = tokio::time::timeout(
        std::time::Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        handshake(engine, &mut reader, &mut writer),
    )
    .await
    .map_err(|_| FailoverError::AckTimeout)??;
    log::info!("failover: operational, peer state {}", peer_state);
    engine.peer_state.store(peer_state.wire(), Ordering::Release);
    engine.touch();
    engine.set_state(FailoverState::Normal);

    let (tx, mut rx) = mpsc::channel::<FailoverMessage>(256);
    *engine.outbound.lock().unwrap() = Some(tx);

    // Ask for everything we may have missed while apart.
    write_frame(&mut writer, &FailoverMessage::UpdReqAll).await?;

    let mut heartbeat =
        tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                let frame = frame?;
                engine.touch();
                match frame {
                    FailoverMessage::Contact => {}
                    FailoverMessage::State { state } => {
                        engine.peer_state.store(state.wire(), Ordering::Release);
                    }
                    FailoverMessage::BndUpd(update) => {
                        let tx_id = update.tx_id;
                        engine.apply_binding(update).await;
                        write_frame(&mut writer, &FailoverMessage::BndAck { tx_id, status: 0 }).await?;
                    }
                    FailoverMessage::BndAck { tx_id, status } => {
                        engine.note_ack(tx_id, status);
                    }
                    FailoverMessage::UpdReqAll => {
                        stream_all_bindings(engine, &mut writer).await?;
                    }
                    FailoverMessage::UpdDone => {
                        log::info!("failover: peer resync complete");
                    }
                    FailoverMessage::PoolReq => {
                        log::debug!("failover: POOLREQ ignored, pools are shared by split");
                    }
                    FailoverMessage::Disconnect => {
                        log::info!("failover: peer requested disconnect");
                        return Ok(());
                    }
                    FailoverMessage::Connect { .. } | FailoverMessage::ConnectAck { .. } => {
                        log::warn!("failover: unexpected handshake frame mid-session");
                    }
                }
            }
            queued = rx.recv() => {
                if let Some(message) = queued {
                    write_frame(&mut writer, &message).await?;
                }
            }
            _ = heartbeat.tick() => {
                write_frame(&mut writer, &FailoverMessage::Contact).await?;
                engine.sweep_pending();
                if engine.seconds_since_heard() > engine.config.max_response_delay_secs as i64 {
                    log::warn!("failover: peer silent beyond max-response-delay");
                    engine.set_state(FailoverState::CommunicationsInterrupted);
                    return Ok(());
                }
            }
            _ = shutdown.changed() => {
                let _ = write_frame(&mut writer, &FailoverMessage::Disconnect).await;
                return Ok(());
            }
        }
    }
}

/// CONNECT travels from the connection initiator (the primary); the
/// acceptor answers CONNECTACK. Returns the peer's advertised state.
async fn handshake<R, W>(
    engine: &FailoverEngine,
    reader: &mut R,
    writer: &mut W,
) -> Result<FailoverState, crate::core::errors::FailoverError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use crate::core::errors::FailoverError;

    match engine.config.role {
        FailoverRole::Primary => {
            let connect = FailoverMessage::Connect {
                version: PROTOCOL_VERSION,
                send_time: Utc::now().timestamp().max(0) as u32,
                mclt: engine.config.mclt_secs,
                split: engine.config.split,
                role: engine.config.role,
                state: engine.state(),
                local_addr: engine.config.local_addr,
            };
            write_frame(writer, &connect).await?;
            match read_frame(reader).await? {
                FailoverMessage::ConnectAck {
                    reject_reason: 0,
                    state,
                } => Ok(state),
                FailoverMessage::ConnectAck { reject_reason, .. } => {
                    Err(FailoverError::PeerRejected(reject_reason))
                }
                _ => Err(FailoverError::BadFrame("expected CONNECTACK")),
            }
        }
        FailoverRole::Secondary => match read_frame(reader).await? {
            FailoverMessage::Connect {
                version,
                role,
                state,
                ..
            } => {
                if version.0 != PROTOCOL_VERSION.0 {
                    let nack = FailoverMessage::ConnectAck {
                        reject_reason: 1,
                        state: engine.state(),
                    };
                    write_frame(writer, &nack).await?;
                    return Err(FailoverError::BadFrame("protocol version mismatch"));
                }
                if role == engine.config.role {
                    let nack = FailoverMessage::ConnectAck {
                        reject_reason: 2,
                        state: engine.state(),
                    };
                    write_frame(writer, &nack).await?;
                    return Err(FailoverError::BadFrame("both peers claim the same role"));
                }
                let ack = FailoverMessage::ConnectAck {
                    reject_reason: 0,
                    state: engine.state(),
                };
                write_frame(writer, &ack).await?;
                Ok(state)
            }
            _ => Err(FailoverError::BadFrame("expected CONNECT")),
        },
    }
}

async fn stream_all_bindings<W: AsyncWrite + Unpin>(
    engine: &FailoverEngine,
    writer: &mut W,
) -> Result<(), crate::core::errors::FailoverError> {
    let leases = engine.store.active_leases(Utc::now());
    log::info!("failover: streaming {} bindings to peer", leases.len());
    for lease in leases {
        let update = BindingUpdate {
            tx_id: engine.next_tx_id.fetch_add(1, Ordering::Relaxed),
            address: lease.ip_address,
            hardware_address: lease.hardware_address,
            state: BindingState::Active,
            start_time: lease.start.timestamp().max(0) as u32,
            end_time: lease.expiration.timestamp().max(0) as u32,
        };
        write_frame(writer, &FailoverMessage::BndUpd(update)).await?;
    }
    write_frame(writer, &FailoverMessage::UpdDone).await?;
    Ok(())
}
