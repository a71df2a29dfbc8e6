//! End-to-end scenarios driven through the dispatcher with an
//! in-memory lease store and a directly constructed configuration
//! snapshot.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use dhcpd_core::config::index::Snapshot;
use dhcpd_core::config::model::{DdnsConfig, Pool, Reservation, Subnet};
use dhcpd_core::core::dispatcher::{Dispatcher, Reply, StaticSnapshot};
use dhcpd_core::core::leases::LeaseStore;
use dhcpd_core::core::options::{codes, MessageType};
use dhcpd_core::core::packet::{HardwareAddress, FLAG_BROADCAST, MAGIC_COOKIE};
use dhcpd_core::ddns::client::DdnsUpdater;
use dhcpd_core::ddns::tsig::{verify, TsigKey};

const SERVER_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn hw(last: u8) -> HardwareAddress {
    HardwareAddress::new([0xAA, 0xBB, 0xCC, 0x00, 0x00, last])
}

/// Renders a BOOTREQUEST the way a client would.
fn frame(
    xid: [u8; 4],
    hw: HardwareAddress,
    flags: u16,
    options: &[(u8, Vec<u8>)],
) -> Vec<u8> {
    let mut raw = vec![0u8; 240];
    raw[0] = 1;
    raw[1] = 1;
    raw[2] = 6;
    raw[4..8].copy_from_slice(&xid);
    raw[10..12].copy_from_slice(&flags.to_be_bytes());
    raw[28..34].copy_from_slice(&hw.bytes());
    raw[236..240].copy_from_slice(&MAGIC_COOKIE);
    for (code, value) in options {
        raw.push(*code);
        raw.push(value.len() as u8);
        raw.extend_from_slice(value);
    }
    raw.push(255);
    raw
}

fn lab_subnet() -> Subnet {
    Subnet {
        id: 1,
        name: String::from("lab"),
        network: "10.0.0.0/24".parse().unwrap(),
        router: Some("10.0.0.1".parse().unwrap()),
        broadcast: None,
        domain_name: None,
        dns_servers: vec![],
        ntp_servers: vec![],
        wins_servers: vec![],
        default_lease_secs: 3600,
        max_lease_secs: 86400,
        mtu: None,
        tftp_server: Some(String::from("10.0.0.1")),
        boot_filename: None,
        boot_filename_uefi: None,
        domain_search: vec![],
        static_routes: vec![],
        time_offset: None,
        timezone: None,
        interface_name: None,
        enabled: true,
    }
}

fn lab_pool() -> Pool {
    Pool {
        id: 1,
        subnet_id: 1,
        range_start: "10.0.0.100".parse().unwrap(),
        range_end: "10.0.0.110".parse().unwrap(),
        priority: 10,
        allow_unknown_clients: true,
        deny_bootp: false,
        known_clients_only: false,
        enabled: true,
    }
}

fn dispatcher_with(reservations: Vec<Reservation>) -> (Dispatcher, Arc<LeaseStore>) {
    let snapshot = Snapshot::assemble(
        vec![lab_subnet()],
        vec![lab_pool()],
        vec![],
        vec![],
        reservations,
        vec![],
    );
    let store = Arc::new(LeaseStore::in_memory());
    let dispatcher = Dispatcher::new(
        Arc::new(StaticSnapshot(Arc::new(snapshot))),
        store.clone(),
        SERVER_ID,
    );
    (dispatcher, store)
}

fn option<'a>(reply: &'a Reply, code: u8) -> Option<&'a [u8]> {
    reply
        .packet
        .options
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, v)| v.as_slice())
}

#[tokio::test]
async fn s1_fresh_discover_offers_the_first_pool_address() {
    let (dispatcher, _store) = dispatcher_with(vec![]);
    let raw = frame(
        [0x12, 0x34, 0x56, 0x78],
        hw(1),
        FLAG_BROADCAST,
        &[(codes::MESSAGE_TYPE, vec![1])],
    );

    let reply = dispatcher.handle_frame(&raw, None).await.unwrap();
    assert_eq!(reply.kind, Some(MessageType::Offer));
    assert_eq!(reply.packet.xid, [0x12, 0x34, 0x56, 0x78]);
    assert_eq!(reply.packet.yiaddr, "10.0.0.100".parse::<Ipv4Addr>().unwrap());
    assert_eq!(reply.packet.siaddr, SERVER_ID);
    assert_eq!(
        reply.destination,
        SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)
    );

    assert_eq!(option(&reply, codes::MESSAGE_TYPE), Some(&[2u8][..]));
    assert_eq!(option(&reply, codes::SERVER_ID), Some(&[10, 0, 0, 1][..]));
    assert_eq!(
        option(&reply, codes::SUBNET_MASK),
        Some(&[255, 255, 255, 0][..])
    );
    assert_eq!(option(&reply, codes::ROUTER), Some(&[10, 0, 0, 1][..]));
    assert_eq!(
        option(&reply, codes::LEASE_TIME),
        Some(&3600u32.to_be_bytes()[..])
    );
}

#[tokio::test]
async fn s2_request_after_discover_commits_the_lease() {
    let (dispatcher, store) = dispatcher_with(vec![]);
    let discover = frame(
        [0x12, 0x34, 0x56, 0x78],
        hw(1),
        FLAG_BROADCAST,
        &[(codes::MESSAGE_TYPE, vec![1])],
    );
    dispatcher.handle_frame(&discover, None).await.unwrap();

    let request = frame(
        [0x12, 0x34, 0x56, 0x79],
        hw(1),
        FLAG_BROADCAST,
        &[
            (codes::MESSAGE_TYPE, vec![3]),
            (codes::REQUESTED_IP, vec![10, 0, 0, 100]),
        ],
    );
    let reply = dispatcher.handle_frame(&request, None).await.unwrap();
    assert_eq!(reply.kind, Some(MessageType::Ack));
    assert_eq!(reply.packet.yiaddr, "10.0.0.100".parse::<Ipv4Addr>().unwrap());
    assert_eq!(
        option(&reply, codes::LEASE_TIME),
        Some(&3600u32.to_be_bytes()[..])
    );

    let by_hw = store.lookup_by_hw(&hw(1)).unwrap();
    assert_eq!(by_hw.ip_address, "10.0.0.100".parse::<Ipv4Addr>().unwrap());
    let by_ip = store
        .lookup_by_ip("10.0.0.100".parse().unwrap())
        .unwrap();
    assert_eq!(by_ip.hardware_address, hw(1));
}

#[tokio::test]
async fn s3_conflicting_request_gets_a_minimal_nak() {
    let (dispatcher, _store) = dispatcher_with(vec![]);
    let request1 = frame(
        [0, 0, 0, 1],
        hw(1),
        0,
        &[
            (codes::MESSAGE_TYPE, vec![3]),
            (codes::REQUESTED_IP, vec![10, 0, 0, 100]),
        ],
    );
    dispatcher.handle_frame(&request1, None).await.unwrap();

    let request2 = frame(
        [0, 0, 0, 2],
        hw(2),
        0,
        &[
            (codes::MESSAGE_TYPE, vec![3]),
            (codes::REQUESTED_IP, vec![10, 0, 0, 100]),
        ],
    );
    let reply = dispatcher.handle_frame(&request2, None).await.unwrap();
    assert_eq!(reply.kind, Some(MessageType::Nak));
    assert_eq!(reply.packet.yiaddr, Ipv4Addr::UNSPECIFIED);
    assert_eq!(reply.packet.ciaddr, Ipv4Addr::UNSPECIFIED);
    // Only the message type and our identity.
    assert_eq!(reply.packet.options.len(), 2);
    assert_eq!(option(&reply, codes::MESSAGE_TYPE), Some(&[6u8][..]));
    assert_eq!(option(&reply, codes::SERVER_ID), Some(&[10, 0, 0, 1][..]));
}

#[tokio::test]
async fn s4_reservation_beats_the_pool() {
    let (dispatcher, _store) = dispatcher_with(vec![Reservation {
        hardware_address: hw(3),
        ip_address: "10.0.0.50".parse().unwrap(),
    }]);
    let discover = frame([0, 0, 0, 3], hw(3), 0, &[(codes::MESSAGE_TYPE, vec![1])]);
    let reply = dispatcher.handle_frame(&discover, None).await.unwrap();
    assert_eq!(reply.kind, Some(MessageType::Offer));
    assert_eq!(reply.packet.yiaddr, "10.0.0.50".parse::<Ipv4Addr>().unwrap());
}

#[tokio::test]
async fn s5_ddns_update_is_signed_and_well_formed() {
    // A stand-in resolver that records what it gets and answers
    // NOERROR.
    let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = server.local_addr().unwrap().port();
    let (packets_tx, mut packets_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        for _ in 0..2 {
            let Ok((len, from)) = server.recv_from(&mut buf).await else {
                return;
            };
            let mut answer = vec![0u8; 12];
            answer[0] = buf[0];
            answer[1] = buf[1];
            answer[2] = 0x80;
            let _ = server.send_to(&answer, from).await;
            let _ = packets_tx.send(buf[..len].to_vec()).await;
        }
    });

    let secret_b64 = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(b"s5-shared-secret")
    };
    let config = DdnsConfig {
        id: 1,
        subnet_id: None,
        forward_zone: String::from("lab.example."),
        reverse_zone: None,
        server: "127.0.0.1".parse().unwrap(),
        port,
        key_name: Some(String::from("k")),
        key_secret: Some(secret_b64.clone()),
        key_algorithm: Some(String::from("hmac-sha256")),
        ttl: 300,
        override_client_update: false,
        enabled: true,
    };

    let updater = DdnsUpdater::new(None);
    updater
        .register(&config, "alice", "10.0.0.100".parse().unwrap())
        .await;

    // The forward (A) update is the first packet out.
    let forward = packets_rx.recv().await.unwrap();
    assert_eq!(forward[2], 0x28, "Opcode must be UPDATE");
    assert_eq!(forward[3], 0x00);

    // It ends in a TSIG record naming hmac-sha256 whose MAC
    // verifies under the shared key.
    let algorithm_wire = b"\x0bhmac-sha256\x00";
    assert!(forward
        .windows(algorithm_wire.len())
        .any(|w| w == algorithm_wire));
    let key = TsigKey::from_config("k", &secret_b64, "hmac-sha256").unwrap();
    assert!(verify(&forward, &key));
}

#[tokio::test]
async fn s6_declined_addresses_are_not_reoffered() {
    let (dispatcher, store) = dispatcher_with(vec![]);
    let decline = frame(
        [0, 0, 0, 1],
        hw(1),
        0,
        &[
            (codes::MESSAGE_TYPE, vec![4]),
            (codes::REQUESTED_IP, vec![10, 0, 0, 100]),
        ],
    );
    assert!(dispatcher.handle_frame(&decline, None).await.is_none());
    assert!(store.is_declined("10.0.0.100".parse().unwrap(), chrono::Utc::now()));

    let discover = frame([0, 0, 0, 4], hw(4), 0, &[(codes::MESSAGE_TYPE, vec![1])]);
    let reply = dispatcher.handle_frame(&discover, None).await.unwrap();
    assert_eq!(reply.packet.yiaddr, "10.0.0.101".parse::<Ipv4Addr>().unwrap());
}

#[tokio::test]
async fn sequentially_dispatched_clients_never_share_an_address() {
    let (dispatcher, store) = dispatcher_with(vec![]);
    let mut assigned = std::collections::HashSet::new();

    // The dispatcher is the single consumer of the fan-in queue, so
    // requests are serialized exactly like this loop.
    for client in 1..=5u8 {
        let discover = frame(
            [0, 0, 0, client],
            hw(client),
            0,
            &[(codes::MESSAGE_TYPE, vec![1])],
        );
        let offer = dispatcher.handle_frame(&discover, None).await.unwrap();
        let offered = offer.packet.yiaddr;

        let request = frame(
            [0, 0, 1, client],
            hw(client),
            0,
            &[
                (codes::MESSAGE_TYPE, vec![3]),
                (codes::REQUESTED_IP, offered.octets().to_vec()),
            ],
        );
        let ack = dispatcher.handle_frame(&request, None).await.unwrap();
        assert_eq!(ack.kind, Some(MessageType::Ack));
        assert!(assigned.insert(offered), "{} offered twice", offered);
    }
    assert_eq!(store.len(), 5);
}

#[tokio::test]
async fn bad_magic_yields_no_reply() {
    let (dispatcher, _store) = dispatcher_with(vec![]);
    let mut raw = frame([0, 0, 0, 1], hw(1), 0, &[(codes::MESSAGE_TYPE, vec![1])]);
    raw[236] = 0x00;
    assert!(dispatcher.handle_frame(&raw, None).await.is_none());
    assert_eq!(
        dispatcher
            .stats()
            .decode_errors
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn inform_returns_configuration_without_a_lease() {
    let (dispatcher, store) = dispatcher_with(vec![]);
    let mut raw = frame([0, 0, 0, 9], hw(9), 0, &[(codes::MESSAGE_TYPE, vec![8])]);
    raw[12..16].copy_from_slice(&[10, 0, 0, 55]);
    let reply = dispatcher.handle_frame(&raw, None).await.unwrap();
    assert_eq!(reply.kind, Some(MessageType::Ack));
    assert_eq!(reply.packet.yiaddr, Ipv4Addr::UNSPECIFIED);
    assert!(option(&reply, codes::LEASE_TIME).is_none());
    assert_eq!(
        reply.destination,
        SocketAddrV4::new("10.0.0.55".parse().unwrap(), 68)
    );
    assert_eq!(store.len(), 0);
}
