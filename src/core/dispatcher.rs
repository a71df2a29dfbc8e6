//! The per-packet state machine: DISCOVER→OFFER, REQUEST→ACK/NAK,
//! INFORM→ACK, RELEASE and DECLINE, with BOOTP handled as a flag on
//! the same path.
//!
//! The handler is the error boundary of the pipeline. Nothing below
//! it escapes: malformed frames are counted and dropped, allocation
//! denials become NAKs or silence, and persistence, DDNS and peer
//! replication all happen on background tasks after the reply bytes
//! are produced.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::index::{ConfigIndex, Snapshot};
use crate::config::model::{ClientClass, Subnet};
use crate::ddns::client::DdnsUpdater;
use crate::failover::frame::BindingState;
use crate::failover::peer::FailoverEngine;
use crate::netio::sender::reply_destination;

use super::allocator::{allocate, AllocRequest};
use super::errors::AllocationError;
use super::leases::{LeaseStore, LeaseV4};
use super::options::{codes, encode_addr_list, encode_classless_routes, encode_domain_search, MessageType};
use super::packet::{DhcpV4Packet, HardwareAddress, ReplyPacket};

/// Where the dispatcher gets its configuration snapshot. The live
/// implementation is [`ConfigIndex`]; tests pin a static snapshot.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self) -> Arc<Snapshot>;
}

#[async_trait]
impl SnapshotProvider for ConfigIndex {
    async fn snapshot(&self) -> Arc<Snapshot> {
        ConfigIndex::snapshot(self).await
    }
}

/// A fixed snapshot, never reloaded.
pub struct StaticSnapshot(pub Arc<Snapshot>);

#[async_trait]
impl SnapshotProvider for StaticSnapshot {
    async fn snapshot(&self) -> Arc<Snapshot> {
        self.0.clone()
    }
}

/// A synthesized reply plus its routing.
pub struct Reply {
    pub packet: ReplyPacket,
    pub destination: SocketAddrV4,
    pub interface: Option<String>,
    /// `None` for pure BOOTP replies, which carry no option 53.
    pub kind: Option<MessageType>,
}

/// Packet-boundary counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub decode_errors: AtomicU64,
    pub truncated_options: AtomicU64,
    pub offers: AtomicU64,
    pub acks: AtomicU64,
    pub naks: AtomicU64,
    pub bootp_replies: AtomicU64,
    pub silent_drops: AtomicU64,
}

pub struct Dispatcher {
    config: Arc<dyn SnapshotProvider>,
    store: Arc<LeaseStore>,
    server_id: Ipv4Addr,
    ddns: Option<Arc<DdnsUpdater>>,
    failover: Option<Arc<FailoverEngine>>,
    stats: DispatchStats,
}

struct Selection<'a> {
    snapshot: &'a Snapshot,
    subnet: &'a Subnet,
    class: Option<&'a ClientClass>,
    hw: HardwareAddress,
    now: DateTime<Utc>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<dyn SnapshotProvider>,
        store: Arc<LeaseStore>,
        server_id: Ipv4Addr,
    ) -> Self {
        Self {
            config,
            store,
            server_id,
            ddns: None,
            failover: None,
            stats: DispatchStats::default(),
        }
    }

    pub fn with_ddns(mut self, ddns: Arc<DdnsUpdater>) -> Self {
        self.ddns = Some(ddns);
        self
    }

    pub fn with_failover(mut self, failover: Arc<FailoverEngine>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Entry point for raw payloads off the fan-in queue. Every
    /// failure mode ends here as a counted drop or a NAK.
    pub async fn handle_frame(
        &self,
        payload: &[u8],
        interface: Option<String>,
    ) -> Option<Reply> {
        let packet = match DhcpV4Packet::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Relaxed);
                log::trace!("dropping frame: {}", e);
                return None;
            }
        };
        if packet.options_truncated {
            self.stats.truncated_options.fetch_add(1, Relaxed);
            log::debug!(
                "dropping request from {} with truncated options",
                packet.hardware_address()
            );
            return None;
        }
        self.handle(packet, interface).await
    }

    pub async fn handle(
        &self,
        request: DhcpV4Packet,
        interface: Option<String>,
    ) -> Option<Reply> {
        let context_id = Uuid::new_v4();
        let snapshot = self.config.snapshot().await;
        let hw = request.hardware_address();
        let now = Utc::now();

        let hostname = request.options.hostname();
        let vendor = request.options.vendor_class();

        let Some(subnet) = snapshot.select_subnet(
            request.giaddr,
            request.ciaddr,
            request.options.requested_address(),
            interface.as_deref(),
        ) else {
            self.stats.silent_drops.fetch_add(1, Relaxed);
            log::debug!("[{}] no subnet matches request from {}", context_id, hw);
            return None;
        };
        let class = snapshot.match_class(vendor.as_deref(), &hw, hostname.as_deref());

        let message_type = request.message_type();
        log::debug!(
            "[{}] {} from {} on subnet {} (class {:?})",
            context_id,
            message_type.map(|m| m.to_string()).unwrap_or_else(|| String::from("BOOTP")),
            hw,
            subnet.name,
            class.map(|c| c.name.as_str())
        );

        let selection = Selection {
            snapshot: &snapshot,
            subnet,
            class: class.map(|c| c.as_ref()),
            hw,
            now,
        };

        let mut reply = match message_type {
            Some(MessageType::Discover) => self.handle_discover(&request, &selection),
            Some(MessageType::Request) => self.handle_request(&request, &selection).await,
            Some(MessageType::Release) => {
                self.handle_release(&request, &selection).await;
                None
            }
            Some(MessageType::Decline) => {
                self.handle_decline(&request, &selection).await;
                None
            }
            Some(MessageType::Inform) => self.handle_inform(&request, &selection),
            None => self.handle_bootp(&request, &selection).await,
            Some(other) => {
                log::debug!("[{}] unexpected {} from a client", context_id, other);
                Some(self.nak(&request))
            }
        };

        // Replies leave on the interface the request arrived on.
        if let Some(reply) = &mut reply {
            reply.interface = interface;
        }

        match &reply {
            Some(reply) => match reply.kind {
                Some(MessageType::Offer) => {
                    self.stats.offers.fetch_add(1, Relaxed);
                }
                Some(MessageType::Ack) => {
                    self.stats.acks.fetch_add(1, Relaxed);
                }
                Some(MessageType::Nak) => {
                    self.stats.naks.fetch_add(1, Relaxed);
                }
                None => {
                    self.stats.bootp_replies.fetch_add(1, Relaxed);
                }
                _ => {}
            },
            None => {
                self.stats.silent_drops.fetch_add(1, Relaxed);
            }
        }
        reply
    }

    /// DISCOVER never writes the lease; the offer is implicit and the
    /// address is only committed when the client comes back with a
    /// REQUEST.
    fn handle_discover(
        &self,
        request: &DhcpV4Packet,
        selection: &Selection<'_>,
    ) -> Option<Reply> {
        if let Some(engine) = &self.failover {
            if !engine.can_serve() {
                return None;
            }
        }

        let alloc = AllocRequest {
            hw: selection.hw,
            requested: request.options.requested_address(),
            is_bootp: false,
            class: selection.class,
        };
        let offered = allocate(
            selection.snapshot,
            selection.subnet,
            &self.store,
            &alloc,
            selection.now,
        )?;

        if let Some(engine) = &self.failover {
            if !engine.responsible_for(&selection.hw, Some(offered)) {
                log::trace!("{} belongs to the peer, staying silent", selection.hw);
                return None;
            }
        }

        let lease_secs = self.choose_lease_secs(request, selection.subnet);
        Some(self.build_reply(request, selection, MessageType::Offer, offered, Some(lease_secs)))
    }

    async fn handle_request(
        &self,
        request: &DhcpV4Packet,
        selection: &Selection<'_>,
    ) -> Option<Reply> {
        if let Some(engine) = &self.failover {
            if !engine.can_serve() {
                return None;
            }
        }

        // A REQUEST addressed to a different server is not ours to
        // honor.
        if let Some(server_id) = request.options.server_identifier() {
            if server_id != self.server_id {
                return Some(self.nak(request));
            }
        }

        // Option 50, else whatever the client already holds.
        let intended = request
            .options
            .requested_address()
            .or_else(|| {
                let nonzero = !request.ciaddr.is_unspecified();
                nonzero.then_some(request.ciaddr)
            })
            .or_else(|| {
                self.store
                    .lookup_by_hw(&selection.hw)
                    .map(|lease| lease.ip_address)
            });
        let Some(intended) = intended else {
            return Some(self.nak(request));
        };

        if let Some(denial) = self.deny_request(selection, intended) {
            log::debug!("denying {} to {}: {}", intended, selection.hw, denial);
            return Some(self.nak(request));
        }

        let lease_secs = self.choose_lease_secs(request, selection.subnet);
        let mut expiration = selection.now + Duration::seconds(lease_secs as i64);
        if let Some(engine) = &self.failover {
            expiration = engine.cap_expiration(intended, expiration, selection.now);
        }
        let granted_secs = (expiration - selection.now).num_seconds().max(0) as u32;

        let hostname = request
            .options
            .hostname()
            .or_else(|| request.options.client_fqdn());
        let lease = LeaseV4::new(
            selection.hw,
            intended,
            hostname.clone(),
            selection.now,
            expiration,
        );
        self.store.upsert(lease.clone()).await;
        log::info!("leased {} to {} for {}s", intended, selection.hw, granted_secs);

        self.spawn_side_effects(selection, lease, hostname);
        Some(self.build_reply(request, selection, MessageType::Ack, intended, Some(granted_secs)))
    }

    /// Denial checks shared by REQUEST and BOOTP, in NAK-reason
    /// order: wrong reservation, out of range, quarantined, held by
    /// someone else, reserved to someone else.
    fn deny_request(
        &self,
        selection: &Selection<'_>,
        intended: Ipv4Addr,
    ) -> Option<AllocationError> {
        if let Some(reserved) = selection.snapshot.reservation_for(&selection.hw) {
            if reserved != intended {
                return Some(AllocationError::ReservationMismatch {
                    addr: intended,
                    hw: selection.hw,
                });
            }
            // The reservation overrides every other rule.
            return None;
        }
        if !selection.subnet.contains(intended) {
            return Some(AllocationError::OutOfRange(intended));
        }
        if self.store.is_declined(intended, selection.now) {
            return Some(AllocationError::Quarantined(intended));
        }
        if let Some(holder) = self.store.lookup_by_ip(intended) {
            if holder.hardware_address != selection.hw && holder.is_active(selection.now) {
                return Some(AllocationError::LeaseConflict {
                    addr: intended,
                    holder: holder.hardware_address,
                });
            }
        }
        if let Some(owner) = selection.snapshot.reservation_holder(intended) {
            if owner != selection.hw {
                return Some(AllocationError::LeaseConflict {
                    addr: intended,
                    holder: owner,
                });
            }
        }
        None
    }

    async fn handle_release(&self, request: &DhcpV4Packet, selection: &Selection<'_>) {
        let Some(lease) = self.store.remove_by_hw(&selection.hw).await else {
            return;
        };
        if !request.ciaddr.is_unspecified() && request.ciaddr != lease.ip_address {
            log::debug!(
                "{} released {} while holding {}",
                selection.hw,
                request.ciaddr,
                lease.ip_address
            );
        }
        log::info!("released {} from {}", lease.ip_address, selection.hw);

        if let (Some(ddns), Some(hostname)) = (&self.ddns, lease.hostname.clone()) {
            if let Some(config) = selection.snapshot.ddns_for(selection.subnet.id) {
                let ddns = ddns.clone();
                let config = config.clone();
                let addr = lease.ip_address;
                tokio::spawn(async move {
                    ddns.withdraw(&config, &hostname, addr).await;
                });
            }
        }
        if let Some(engine) = &self.failover {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .replicate(
                        lease.hardware_address,
                        lease.ip_address,
                        BindingState::Released,
                        lease.start,
                        lease.expiration,
                    )
                    .await;
            });
        }
    }

    async fn handle_decline(&self, request: &DhcpV4Packet, selection: &Selection<'_>) {
        let Some(declined) = request.options.requested_address() else {
            return;
        };
        log::warn!("{} declined {}, quarantining", selection.hw, declined);
        self.store.mark_declined(declined, selection.now).await;

        if let Some(engine) = &self.failover {
            let engine = engine.clone();
            let hw = selection.hw;
            let now = selection.now;
            tokio::spawn(async move {
                engine
                    .replicate(hw, declined, BindingState::Abandoned, now, now)
                    .await;
            });
        }
    }

    /// INFORM: configuration only, no allocation and no lease time.
    fn handle_inform(
        &self,
        request: &DhcpV4Packet,
        selection: &Selection<'_>,
    ) -> Option<Reply> {
        let mut reply =
            self.build_reply(request, selection, MessageType::Ack, Ipv4Addr::UNSPECIFIED, None);
        reply.packet.yiaddr = Ipv4Addr::UNSPECIFIED;
        Some(reply)
    }

    /// Legacy BOOTP: allocate and commit in one step, reply with a
    /// plain BOOTREPLY carrying no message-type option.
    async fn handle_bootp(
        &self,
        request: &DhcpV4Packet,
        selection: &Selection<'_>,
    ) -> Option<Reply> {
        if let Some(engine) = &self.failover {
            if !engine.can_serve() {
                return None;
            }
        }

        let alloc = AllocRequest {
            hw: selection.hw,
            requested: request.options.requested_address(),
            is_bootp: true,
            class: selection.class,
        };
        let addr = allocate(
            selection.snapshot,
            selection.subnet,
            &self.store,
            &alloc,
            selection.now,
        )?;
        if self.deny_request(selection, addr).is_some() {
            return None;
        }

        let lease_secs = selection.subnet.default_lease_secs;
        let lease = LeaseV4::new(
            selection.hw,
            addr,
            None,
            selection.now,
            selection.now + Duration::seconds(lease_secs as i64),
        );
        self.store.upsert(lease.clone()).await;
        self.spawn_side_effects(selection, lease, None);

        let mut reply = ReplyPacket::for_request(request);
        reply.yiaddr = addr;
        self.apply_boot_fields(&mut reply, request, selection);
        reply.push_option(codes::SUBNET_MASK, selection.subnet.mask().octets().to_vec());
        if let Some(router) = selection.subnet.router {
            reply.push_option(codes::ROUTER, router.octets().to_vec());
        }
        Some(Reply {
            destination: reply_destination(request),
            interface: None,
            kind: None,
            packet: reply,
        })
    }

    /// NAK carries only the message type and our identity; yiaddr and
    /// ciaddr are zeroed and the broadcast flag rides along.
    fn nak(&self, request: &DhcpV4Packet) -> Reply {
        let mut reply = ReplyPacket::for_request(request);
        reply.ciaddr = Ipv4Addr::UNSPECIFIED;
        reply.push_option(codes::MESSAGE_TYPE, vec![MessageType::Nak.code()]);
        reply.push_option(codes::SERVER_ID, self.server_id.octets().to_vec());
        Reply {
            destination: reply_destination(request),
            interface: None,
            kind: Some(MessageType::Nak),
            packet: reply,
        }
    }

    /// min(max, option 51 when it fits, else the subnet default).
    fn choose_lease_secs(&self, request: &DhcpV4Packet, subnet: &Subnet) -> u32 {
        let wanted = match request.options.lease_time() {
            Some(requested) if requested <= subnet.max_lease_secs => requested,
            _ => subnet.default_lease_secs,
        };
        wanted.min(subnet.max_lease_secs)
    }

    fn build_reply(
        &self,
        request: &DhcpV4Packet,
        selection: &Selection<'_>,
        kind: MessageType,
        yiaddr: Ipv4Addr,
        lease_secs: Option<u32>,
    ) -> Reply {
        let subnet = selection.subnet;
        let mut reply = ReplyPacket::for_request(request);
        reply.yiaddr = yiaddr;

        reply.push_option(codes::MESSAGE_TYPE, vec![kind.code()]);
        reply.push_option(codes::SERVER_ID, self.server_id.octets().to_vec());
        reply.push_option(codes::SUBNET_MASK, subnet.mask().octets().to_vec());
        if let Some(router) = subnet.router {
            reply.push_option(codes::ROUTER, router.octets().to_vec());
        }
        if let Some(secs) = lease_secs {
            reply.push_option(codes::LEASE_TIME, secs.to_be_bytes().to_vec());
            // T1 at half, T2 at seven eighths.
            reply.push_option(codes::RENEWAL_TIME, (secs / 2).to_be_bytes().to_vec());
            reply.push_option(
                codes::REBINDING_TIME,
                (secs / 8 * 7).to_be_bytes().to_vec(),
            );
        }
        reply.push_option(
            codes::BROADCAST_ADDR,
            subnet.broadcast_addr().octets().to_vec(),
        );
        if !subnet.dns_servers.is_empty() {
            reply.push_option(codes::DNS_SERVER, encode_addr_list(&subnet.dns_servers));
        }
        if let Some(domain) = &subnet.domain_name {
            reply.push_option(codes::DOMAIN_NAME, domain.as_bytes().to_vec());
        }
        if !subnet.ntp_servers.is_empty() {
            reply.push_option(codes::NTP_SERVERS, encode_addr_list(&subnet.ntp_servers));
        }
        if !subnet.wins_servers.is_empty() {
            reply.push_option(codes::WINS_SERVERS, encode_addr_list(&subnet.wins_servers));
        }
        if let Some(mtu) = subnet.mtu {
            reply.push_option(codes::INTERFACE_MTU, mtu.to_be_bytes().to_vec());
        }
        if let Some(offset) = subnet.time_offset {
            reply.push_option(codes::TIME_OFFSET, offset.to_be_bytes().to_vec());
        }
        if let Some(tz) = &subnet.timezone {
            reply.push_option(codes::POSIX_TIMEZONE, tz.as_bytes().to_vec());
        }
        if !subnet.domain_search.is_empty() {
            reply.push_option(
                codes::DOMAIN_SEARCH,
                encode_domain_search(&subnet.domain_search),
            );
        }
        if !subnet.static_routes.is_empty() {
            reply.push_option(
                codes::CLASSLESS_ROUTES,
                encode_classless_routes(&subnet.static_routes),
            );
        }

        if let Some(prl) = request.options.parameter_request_list() {
            log::trace!("client parameter request list: {:?}", prl);
        }

        self.apply_boot_fields(&mut reply, request, selection);

        Reply {
            destination: reply_destination(request),
            interface: None,
            kind: Some(kind),
            packet: reply,
        }
    }

    /// TFTP and boot-file provisioning, PXE sub-options included.
    /// Option 93 is authoritative for the UEFI choice; the
    /// vendor-class substring is the compatibility fallback.
    fn apply_boot_fields(
        &self,
        reply: &mut ReplyPacket,
        request: &DhcpV4Packet,
        selection: &Selection<'_>,
    ) {
        let subnet = selection.subnet;
        let vendor = request.options.vendor_class().unwrap_or_default();
        let is_pxe = vendor.contains("PXEClient");

        if let Some(tftp) = &subnet.tftp_server {
            reply.sname = Some(tftp.clone());
            if let Ok(addr) = tftp.parse::<Ipv4Addr>() {
                reply.siaddr = addr;
            }
        }
        if let Some(next_server) = selection.class.and_then(|c| c.next_server.as_ref()) {
            if let Ok(addr) = next_server.parse::<Ipv4Addr>() {
                reply.siaddr = addr;
            }
        }

        let uefi = match request.options.pxe_client_arch() {
            Some(arch) => arch == 0x0007 || arch == 0x0009,
            None => vendor.contains("00007"),
        };
        let boot_file = selection
            .class
            .and_then(|c| c.boot_filename.clone())
            .or_else(|| {
                if uefi {
                    subnet.boot_filename_uefi.clone()
                } else {
                    subnet.boot_filename.clone()
                }
            });
        let Some(boot_file) = boot_file else { return };
        reply.file = Some(boot_file.clone());

        if is_pxe {
            if let Some(tftp) = &subnet.tftp_server {
                reply.push_option(codes::TFTP_SERVER_NAME, tftp.as_bytes().to_vec());
            }
            reply.push_option(codes::BOOT_FILE_NAME, boot_file.into_bytes());
            if let Some(arch) = request.options.pxe_client_arch() {
                reply.push_option(codes::PXE_CLIENT_ARCH, arch.to_be_bytes().to_vec());
            }
            // PXE vendor information: network interface 1, discovery
            // control 3 (direct boot file download).
            reply.push_option(94, vec![1]);
            reply.push_option(43, vec![6, 1, 3, 255]);
        }
    }

    fn spawn_side_effects(
        &self,
        selection: &Selection<'_>,
        lease: LeaseV4,
        hostname: Option<String>,
    ) {
        if let (Some(ddns), Some(hostname)) = (&self.ddns, hostname) {
            if !hostname.is_empty() {
                if let Some(config) = selection.snapshot.ddns_for(selection.subnet.id) {
                    let ddns = ddns.clone();
                    let config = config.clone();
                    let addr = lease.ip_address;
                    tokio::spawn(async move {
                        ddns.register(&config, &hostname, addr).await;
                    });
                }
            }
        }
        if let Some(engine) = &self.failover {
            let engine = engine.clone();
            let lease = lease.clone();
            tokio::spawn(async move {
                engine.replicate_lease(&lease).await;
            });
        }
    }
}
