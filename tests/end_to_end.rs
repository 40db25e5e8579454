//! 두 소켓을 메모리 네트워크로 연결해 핸드셰이크, 전달/손실 보고, 종료를 검증한다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use rudpkit::stream::BitStream;
use rudpkit::{BytesCodec, Codec, Config, ConnectionMode, ConnectionState, Event, MemoryNetwork, Peer, Socket};

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

/// 소켓과 지금까지 받은 이벤트 기록
struct Node {
    socket: Socket<BytesCodec>,
    addr: SocketAddr,
    log: Vec<Event<Bytes>>,
}

impl Node {
    fn start(network: &MemoryNetwork, config: Config) -> Self {
        let socket = Socket::new(network.platform(), BytesCodec, config).expect("create socket");
        socket.start("127.0.0.1:0".parse().unwrap());

        let mut node = Self {
            socket,
            addr: "0.0.0.0:0".parse().unwrap(),
            log: Vec::new(),
        };
        node.addr = match node.wait_for(|e| matches!(e, Event::Started(_))) {
            Event::Started(addr) => addr,
            _ => unreachable!(),
        };
        node
    }

    /// 조건에 맞는 이벤트가 올 때까지 대기 (모든 이벤트는 기록됨)
    fn wait_for<F>(&mut self, mut predicate: F) -> Event<Bytes>
    where
        F: FnMut(&Event<Bytes>) -> bool,
    {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(!remaining.is_zero(), "timed out, events so far: {:?}", self.log);

            if let Some(event) = self.socket.wait(remaining) {
                self.log.push(event.clone());
                if predicate(&event) {
                    return event;
                }
            }
        }
    }

    /// `duration` 동안 이벤트를 모은다
    fn settle(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            if let Some(event) = self.socket.wait(remaining) {
                self.log.push(event);
            }
        }
    }

    fn count<F: Fn(&Event<Bytes>) -> bool>(&self, f: F) -> usize {
        self.log.iter().filter(|e| f(e)).count()
    }
}

fn connected_peer(event: Event<Bytes>) -> Peer {
    match event {
        Event::Connected(peer) => peer,
        other => panic!("expected Connected, got {:?}", other),
    }
}

/// 서버(자동 수락)와 연결된 클라이언트
fn connected_pair(network: &MemoryNetwork) -> (Node, Node, Peer, Peer) {
    let mut server = Node::start(network, Config::default());
    let mut client = Node::start(network, Config::client());

    client.socket.connect(server.addr);
    let to_server = connected_peer(client.wait_for(|e| matches!(e, Event::Connected(_))));
    let to_client = connected_peer(server.wait_for(|e| matches!(e, Event::Connected(_))));

    assert_eq!(to_server.addr, server.addr);
    assert_eq!(to_client.addr, client.addr);
    (server, client, to_server, to_client)
}

fn is_object(data: &[u8]) -> bool {
    data.first().map_or(false, |b| b & 1 == 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn connect_send_and_deliver_once() {
    let network = MemoryNetwork::new();
    let (mut server, mut client, to_server, _) = connected_pair(&network);

    client.socket.send(to_server, Bytes::from_static(b"hello"));

    match server.wait_for(|e| matches!(e, Event::ObjectReceived { .. })) {
        Event::ObjectReceived { object, .. } => assert_eq!(object, Bytes::from_static(b"hello")),
        _ => unreachable!(),
    }
    client.wait_for(|e| matches!(e, Event::ObjectDelivered { .. }));

    server.settle(Duration::from_millis(300));
    client.settle(Duration::from_millis(300));

    assert_eq!(server.count(|e| matches!(e, Event::Connected(_))), 1);
    assert_eq!(client.count(|e| matches!(e, Event::Connected(_))), 1);
    assert_eq!(server.count(|e| matches!(e, Event::ObjectReceived { .. })), 1);
    assert_eq!(client.count(|e| matches!(e, Event::ObjectSent { .. })), 1);
    assert_eq!(client.count(|e| matches!(e, Event::ObjectDelivered { .. })), 1);
    assert_eq!(client.count(|e| matches!(e, Event::ObjectLost { .. })), 0);
}

#[test]
fn dropped_object_is_reported_lost_exactly_once() {
    let network = MemoryNetwork::new();
    let (mut server, mut client, to_server, _) = connected_pair(&network);

    let client_addr = client.addr;
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    network.set_filter(move |data, from, _| from == client_addr && is_object(data) && !flag.swap(true, Ordering::SeqCst));

    client.socket.send(to_server, Bytes::from_static(b"first"));
    client.socket.send(to_server, Bytes::from_static(b"second"));

    client.wait_for(|e| matches!(e, Event::ObjectLost { object, .. } if &object[..] == b"first"));
    client.wait_for(|e| matches!(e, Event::ObjectDelivered { object, .. } if &object[..] == b"second"));
    client.settle(Duration::from_millis(300));
    server.settle(Duration::from_millis(50));

    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(client.count(|e| matches!(e, Event::ObjectLost { .. })), 1);
    assert_eq!(
        client.count(|e| matches!(e, Event::ObjectDelivered { object, .. } if &object[..] == b"first")),
        0
    );
    assert_eq!(server.count(|e| matches!(e, Event::ObjectReceived { .. })), 1);
}

#[test]
fn lost_ack_packets_are_covered_by_ack_history() {
    let network = MemoryNetwork::new();
    let (mut server, mut client, to_server, _) = connected_pair(&network);

    let server_addr = server.addr;
    let blackout = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&blackout);
    network.set_filter(move |_, from, _| from == server_addr && flag.load(Ordering::SeqCst));

    client.socket.send(to_server, Bytes::from_static(b"payload"));
    server.wait_for(|e| matches!(e, Event::ObjectReceived { .. }));

    // 서버의 ack 패킷 몇 개가 사라진 뒤 회복
    std::thread::sleep(Duration::from_millis(250));
    blackout.store(false, Ordering::SeqCst);

    client.wait_for(|e| matches!(e, Event::ObjectDelivered { .. }));
    client.settle(Duration::from_millis(200));

    assert_eq!(client.count(|e| matches!(e, Event::ObjectDelivered { .. })), 1);
    assert_eq!(client.count(|e| matches!(e, Event::ObjectLost { .. })), 0);
}

#[test]
fn disconnect_reports_pending_objects_lost_before_disconnected() {
    let network = MemoryNetwork::new();
    let (mut server, mut client, to_server, _) = connected_pair(&network);

    // ack가 돌아오지 않게 서버 -> 클라이언트 차단
    let server_addr = server.addr;
    network.set_filter(move |_, from, _| from == server_addr);

    for i in 0..5u8 {
        client.socket.send(to_server, Bytes::from(vec![i]));
    }
    for _ in 0..5 {
        client.wait_for(|e| matches!(e, Event::ObjectSent { .. }));
    }

    client.socket.disconnect(to_server);
    client.wait_for(|e| matches!(e, Event::Disconnected(_)));

    let tail: Vec<&Event<Bytes>> = client
        .log
        .iter()
        .skip_while(|e| !matches!(e, Event::ObjectLost { .. }))
        .collect();
    assert_eq!(tail.len(), 6, "events: {:?}", client.log);
    assert!(tail[..5].iter().all(|e| matches!(e, Event::ObjectLost { .. })));
    assert!(matches!(tail[5], Event::Disconnected(peer) if *peer == to_server));
    assert_eq!(client.count(|e| matches!(e, Event::ObjectDelivered { .. })), 0);

    server.wait_for(|e| matches!(e, Event::Disconnected(_)));
}

#[test]
fn incoming_connection_refused_when_not_allowed() {
    let network = MemoryNetwork::new();
    let server = Node::start(
        &network,
        Config {
            allow_incoming_connections: false,
            ..Config::default()
        },
    );
    let mut client = Node::start(&network, Config::client());

    client.socket.connect(server.addr);
    match client.wait_for(|e| matches!(e, Event::ConnectRefused(_) | Event::Connected(_))) {
        Event::ConnectRefused(addr) => assert_eq!(addr, server.addr),
        other => panic!("expected refusal, got {:?}", other),
    }
}

#[test]
fn connect_fails_after_retries() {
    let network = MemoryNetwork::new();
    let mut client = Node::start(
        &network,
        Config {
            connect_request_attempts: 2,
            connect_request_timeout_ms: 50,
            ..Config::client()
        },
    );

    let nowhere: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let started = Instant::now();
    client.socket.connect(nowhere);

    match client.wait_for(|e| matches!(e, Event::ConnectFailed(_))) {
        Event::ConnectFailed(addr) => assert_eq!(addr, nowhere),
        _ => unreachable!(),
    }
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[test]
fn manual_accept_and_refuse() {
    let network = MemoryNetwork::new();
    let mut server = Node::start(
        &network,
        Config {
            auto_accept_incoming_connections: false,
            ..Config::default()
        },
    );
    let mut accepted = Node::start(&network, Config::client());
    let mut refused = Node::start(&network, Config::client());

    accepted.socket.connect(server.addr);
    refused.socket.connect(server.addr);

    for _ in 0..2 {
        match server.wait_for(|e| matches!(e, Event::ConnectRequest(_))) {
            Event::ConnectRequest(addr) if addr == accepted.addr => server.socket.accept(addr),
            Event::ConnectRequest(addr) => server.socket.refuse(addr),
            _ => unreachable!(),
        }
    }

    accepted.wait_for(|e| matches!(e, Event::Connected(_)));
    refused.wait_for(|e| matches!(e, Event::ConnectRefused(_)));
    server.wait_for(|e| matches!(e, Event::Connected(peer) if peer.addr == accepted.addr));
}

#[test]
fn lost_accepted_command_is_implicitly_accepted() {
    let network = MemoryNetwork::new();
    let mut server = Node::start(&network, Config::default());
    let mut client = Node::start(&network, Config::client());

    let server_addr = server.addr;
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    network.set_filter(move |data, from, _| from == server_addr && !is_object(data) && !flag.swap(true, Ordering::SeqCst));

    let started = Instant::now();
    client.socket.connect(server.addr);
    server.wait_for(|e| matches!(e, Event::Connected(_)));
    client.wait_for(|e| matches!(e, Event::Connected(_)));

    assert!(dropped.load(Ordering::SeqCst));
    // Connect 재시도(1초)보다 먼저 서버 ping으로 연결됨
    assert!(started.elapsed() < Duration::from_millis(1000));

    client.settle(Duration::from_millis(200));
    assert_eq!(client.count(|e| matches!(e, Event::Connected(_))), 1);
}

#[test]
fn stats_query_returns_snapshot() {
    let network = MemoryNetwork::new();
    let (_server, mut client, to_server, _) = connected_pair(&network);

    client.socket.send(to_server, Bytes::from_static(b"x"));
    client.wait_for(|e| matches!(e, Event::ObjectDelivered { .. }));

    client.socket.query_stats(to_server);
    match client.wait_for(|e| matches!(e, Event::Stats(_))) {
        Event::Stats(snapshot) => {
            assert_eq!(snapshot.peer, to_server);
            assert_eq!(snapshot.mode, ConnectionMode::Client);
            assert_eq!(snapshot.state, ConnectionState::Connected);
            assert_eq!(snapshot.stats.packets_delivered, 1);
            assert!(snapshot.stats.packets_sent >= 2);
        }
        _ => unreachable!(),
    }
}

#[test]
fn send_to_stale_peer_fails() {
    let network = MemoryNetwork::new();
    let (_server, mut client, to_server, _) = connected_pair(&network);

    let stale = Peer {
        id: rudpkit::ConnectionId(to_server.id.0 + 100),
        addr: to_server.addr,
    };
    client.socket.send(stale, Bytes::from_static(b"nope"));

    match client.wait_for(|e| matches!(e, Event::ObjectSendFailed { .. })) {
        Event::ObjectSendFailed { reason, .. } => assert_eq!(reason, rudpkit::SendFailReason::NotConnected),
        _ => unreachable!(),
    }
}

#[test]
fn close_disconnects_peers() {
    let network = MemoryNetwork::new();
    let (mut server, client, _, _) = connected_pair(&network);

    drop(client);
    server.wait_for(|e| matches!(e, Event::Disconnected(_)));
}

#[test]
fn always_send_mtu_pads_object_datagrams() {
    let network = MemoryNetwork::new();
    let (_server, mut client, to_server, _) = connected_pair(&network);

    let bytes_sent = |client: &mut Node| {
        client.socket.query_stats(to_server);
        match client.wait_for(|e| matches!(e, Event::Stats(_))) {
            Event::Stats(snapshot) => snapshot.stats.bytes_sent,
            _ => unreachable!(),
        }
    };

    client.socket.set_option(to_server, rudpkit::ConnectionOption::AlwaysSendMtu(true));
    let before = bytes_sent(&mut client);

    client.socket.send(to_server, Bytes::from_static(b"pad"));
    client.wait_for(|e| matches!(e, Event::ObjectSent { .. }));
    let after = bytes_sent(&mut client);

    assert!(after - before >= Config::client().packet_size as u64);
}

#[test]
fn connection_limit_refuses_second_client() {
    let network = MemoryNetwork::new();
    let mut server = Node::start(
        &network,
        Config {
            connection_limit: Some(1),
            ..Config::default()
        },
    );
    let mut first = Node::start(&network, Config::client());
    let mut second = Node::start(&network, Config::client());

    first.socket.connect(server.addr);
    first.wait_for(|e| matches!(e, Event::Connected(_)));
    server.wait_for(|e| matches!(e, Event::Connected(_)));

    second.socket.connect(server.addr);
    match second.wait_for(|e| matches!(e, Event::ConnectRefused(_) | Event::Connected(_))) {
        Event::ConnectRefused(addr) => assert_eq!(addr, server.addr),
        other => panic!("expected refusal, got {:?}", other),
    }
}

#[test]
fn cancel_connect_fails_without_waiting_for_retries() {
    let network = MemoryNetwork::new();
    let mut client = Node::start(&network, Config::client());

    let nowhere: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let started = Instant::now();
    client.socket.connect(nowhere);
    client.socket.cancel_connect(nowhere);

    match client.wait_for(|e| matches!(e, Event::ConnectFailed(_))) {
        Event::ConnectFailed(addr) => assert_eq!(addr, nowhere),
        _ => unreachable!(),
    }
    // 기본 설정이면 재시도 끝까지 5초
    assert!(started.elapsed() < Duration::from_millis(900));

    client.settle(Duration::from_millis(100));
    assert_eq!(client.count(|e| matches!(e, Event::ConnectFailed(_))), 1);
}

/// "boom"을 기록하려 하면 패닉하는 코덱
#[derive(Clone, Default)]
struct FragileCodec(BytesCodec);

impl Codec for FragileCodec {
    type Object = Bytes;

    fn pack(&mut self, stream: &mut BitStream, object: &Bytes) -> rudpkit::Result<()> {
        if &object[..] == b"boom" {
            panic!("codec failure");
        }
        self.0.pack(stream, object)
    }

    fn unpack(&mut self, stream: &mut BitStream) -> rudpkit::Result<Bytes> {
        self.0.unpack(stream)
    }
}

#[test]
fn network_thread_survives_codec_panic() {
    let network = MemoryNetwork::new();
    let mut server = Node::start(&network, Config::default());

    let client = Socket::new(network.platform(), FragileCodec::default(), Config::client()).expect("create socket");
    client.start("127.0.0.1:0".parse().unwrap());
    client.connect(server.addr);

    let deadline = Instant::now() + TIMEOUT;
    let to_server = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "client never connected");
        if let Some(Event::Connected(peer)) = client.wait(remaining) {
            break peer;
        }
    };
    server.wait_for(|e| matches!(e, Event::Connected(_)));

    client.send(to_server, Bytes::from_static(b"boom"));
    client.send(to_server, Bytes::from_static(b"ok"));

    match server.wait_for(|e| matches!(e, Event::ObjectReceived { .. })) {
        Event::ObjectReceived { object, .. } => assert_eq!(object, Bytes::from_static(b"ok")),
        _ => unreachable!(),
    }
}
