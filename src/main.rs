//! Process bootstrap: environment configuration, logging, database
//! warm-up, capture sources, the dispatch loop and graceful
//! shutdown. Exit code 0 is a clean shutdown; anything non-zero is a
//! fatal init error.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use dhcpd_core::config::index::ConfigIndex;
use dhcpd_core::config::model::FailoverRole;
use dhcpd_core::core::dispatcher::Dispatcher;
use dhcpd_core::core::errors::FatalInit;
use dhcpd_core::core::leases::{
    run_batch_writer, run_expiry_sweep, LeaseStore, WRITE_CHANNEL_CAPACITY,
};
use dhcpd_core::core::packet::classify_reply;
use dhcpd_core::ddns::client::DdnsUpdater;
use dhcpd_core::failover::peer::FailoverEngine;
use dhcpd_core::netio::capture::{
    open_portable_socket, BufferPool, PacketSource, UdpCapture, SERVER_PORT,
};
use dhcpd_core::netio::queue::FanInQueue;
use dhcpd_core::netio::sender::{ReplySink, UdpReplySink};
use dhcpd_core::utils::data::DbManager;
use dhcpd_core::utils::logger::init_logger;

const APP_NAME: &str = "dhcpd_core";
const QUEUE_CAPACITY: usize = 4096;
const BUFFER_PREALLOC: usize = 64;

struct EnvConfig {
    db_url: String,
    interfaces: Vec<String>,
    server_id: Ipv4Addr,
    portable: bool,
    role_override: Option<FailoverRole>,
    verbosity: u64,
}

fn read_env() -> Result<EnvConfig, FatalInit> {
    let db_url =
        std::env::var("DHCPD_DB_URL").map_err(|_| FatalInit::MissingConfig("DHCPD_DB_URL"))?;
    let server_id = std::env::var("DHCPD_SERVER_ID")
        .map_err(|_| FatalInit::MissingConfig("DHCPD_SERVER_ID"))?
        .parse::<Ipv4Addr>()
        .map_err(|_| FatalInit::MissingConfig("DHCPD_SERVER_ID (not an IPv4 address)"))?;
    let interfaces: Vec<String> = std::env::var("DHCPD_INTERFACES")
        .unwrap_or_default()
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    let portable = std::env::var("DHCPD_PORTABLE_CAPTURE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let role_override = match std::env::var("DHCPD_FAILOVER_ROLE") {
        Ok(text) => match FailoverRole::parse(&text) {
            Some(role) => Some(role),
            None => return Err(FatalInit::BadRole(text)),
        },
        Err(_) => None,
    };
    let verbosity = std::env::var("DHCPD_VERBOSITY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    Ok(EnvConfig {
        db_url,
        interfaces,
        server_id,
        portable,
        role_override,
        verbosity,
    })
}

fn banner(env: &EnvConfig) {
    let interfaces = if env.interfaces.is_empty() {
        String::from("(all, portable capture)")
    } else {
        env.interfaces.join(", ")
    };
    log::info!("{} starting", APP_NAME);
    log::info!("  interfaces : {}", interfaces);
    log::info!("  bind port  : {}", SERVER_PORT);
    log::info!("  server id  : {}", env.server_id);
    log::info!("  os         : {}", std::env::consts::OS);
    log::info!("  queue cap  : {}", QUEUE_CAPACITY);
}

type CaptureSetup = (Vec<Arc<dyn PacketSource>>, Arc<dyn ReplySink>);

#[cfg(target_os = "linux")]
fn open_raw_profile(
    interfaces: &[String],
    pool: &Arc<BufferPool>,
) -> std::io::Result<CaptureSetup> {
    use dhcpd_core::netio::capture::RawCapture;

    let mut sources: Vec<Arc<dyn PacketSource>> = Vec::new();
    for name in interfaces {
        sources.push(Arc::new(RawCapture::open(name, pool.clone())?));
    }
    let sink: Arc<dyn ReplySink> = Arc::new(UdpReplySink::per_interface(interfaces)?);
    Ok((sources, sink))
}

#[cfg(not(target_os = "linux"))]
fn open_raw_profile(
    _interfaces: &[String],
    _pool: &Arc<BufferPool>,
) -> std::io::Result<CaptureSetup> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "raw capture requires linux",
    ))
}

#[tokio::main]
async fn main() {
    let env = match read_env() {
        Ok(env) => env,
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = init_logger(APP_NAME, env.verbosity) {
        eprintln!("fatal: cannot initialize logging: {}", e);
        std::process::exit(2);
    }
    banner(&env);

    let db = match DbManager::connect(&env.db_url) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!("{}", FatalInit::Database(e));
            std::process::exit(1);
        }
    };

    // Lease store plus its writer and sweeper.
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_CAPACITY);
    let store = Arc::new(LeaseStore::new(Some(write_tx)));
    let warm_db = db.clone();
    match tokio::task::spawn_blocking(move || warm_db.load_active_leases()).await {
        Ok(Ok(leases)) => {
            log::info!("warmed up {} active leases", leases.len());
            store.warm_up(leases);
        }
        Ok(Err(e)) => {
            log::error!("cannot load leases: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("lease warm-up task failed: {}", e);
            std::process::exit(1);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let writer_task = tokio::spawn(run_batch_writer(
        db.clone(),
        write_rx,
        store.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_expiry_sweep(store.clone(), shutdown_rx.clone()));

    let config = Arc::new(ConfigIndex::new(db.clone()));
    // Fail fast on an empty or unreadable configuration.
    let snapshot = config.snapshot().await;
    if snapshot.subnets.is_empty() {
        log::warn!("no enabled subnets configured; serving nothing until the tables fill");
    }

    let ddns = Arc::new(DdnsUpdater::new(Some(db.clone())));
    let mut dispatcher =
        Dispatcher::new(config.clone(), store.clone(), env.server_id).with_ddns(ddns);

    let failover = match db.load_failover_peer() {
        Ok(Some(mut peer)) => {
            if let Some(role) = env.role_override {
                peer.role = role;
            }
            log::info!(
                "failover peer {} ({:?}) at {}:{}",
                peer.name,
                peer.role,
                peer.peer_addr,
                peer.peer_port
            );
            let engine = Arc::new(FailoverEngine::new(peer, store.clone(), Some(db.clone())));
            tokio::spawn(dhcpd_core::failover::peer::run(
                engine.clone(),
                shutdown_rx.clone(),
            ));
            Some(engine)
        }
        Ok(None) => None,
        Err(e) => {
            log::error!("cannot read failover configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(engine) = failover {
        dispatcher = dispatcher.with_failover(engine);
    }
    let dispatcher = Arc::new(dispatcher);

    // Capture sources and the reply sink.
    let pool = BufferPool::new(BUFFER_PREALLOC);
    let queue = Arc::new(FanInQueue::new(QUEUE_CAPACITY));

    let use_raw = cfg!(target_os = "linux") && !env.portable && !env.interfaces.is_empty();
    let (sources, sink) = if use_raw {
        match open_raw_profile(&env.interfaces, &pool) {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("{}", FatalInit::Bind(env.interfaces.join(","), e));
                std::process::exit(1);
            }
        }
    } else {
        if !env.interfaces.is_empty() && !env.portable {
            log::warn!("raw capture unavailable on this platform, using the portable profile");
        }
        let socket = match open_portable_socket(SERVER_PORT) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("{}", FatalInit::Bind(format!("udp:{}", SERVER_PORT), e));
                std::process::exit(1);
            }
        };
        let source: Arc<dyn PacketSource> =
            Arc::new(UdpCapture::new(socket.clone(), pool.clone()));
        let sink: Arc<dyn ReplySink> = Arc::new(UdpReplySink::shared(socket));
        (vec![source], sink)
    };

    // One receiver task per source feeds the fan-in queue.
    for source in sources {
        let queue = queue.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            log::info!("listening on {}", source.label());
            loop {
                tokio::select! {
                    inbound = source.recv() => match inbound {
                        Ok(inbound) => queue.push(inbound),
                        Err(e) => {
                            log::warn!("receive error on {}: {}", source.label(), e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    {
        let queue = queue.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            queue.close();
        });
    }

    // The single dispatch loop: pop, decode, act, encode, send.
    while let Some(inbound) = queue.pop().await {
        let reply = dispatcher
            .handle_frame(inbound.payload(), inbound.interface.clone())
            .await;
        let Some(reply) = reply else { continue };

        let mut out = pool.take();
        let len = match reply.packet.encode_into(&mut out) {
            Ok(len) => len,
            Err(e) => {
                log::error!("reply encode failed: {}", e);
                continue;
            }
        };
        // The reply type is re-read from the encoded bytes for the
        // metrics line.
        if let Some(kind) = classify_reply(&out[..len]) {
            log::trace!("sending {} to {}", kind, reply.destination);
        }
        if let Err(e) = sink
            .send(&out[..len], reply.destination, reply.interface.as_deref())
            .await
        {
            log::warn!("send to {} failed: {}", reply.destination, e);
        }
    }

    log::info!("dispatcher drained, flushing writes");
    let _ = writer_task.await;
    log::info!(
        "clean shutdown ({} frames dropped by the queue)",
        queue.dropped()
    );
}
