//! rudpkit 채팅 서버
//!
//! 클라이언트가 보낸 메시지를 연결된 모든 클라이언트에게 중계한다.
//! 손실 판정된 메시지는 같은 클라이언트에게 다시 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin rudp-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행
//!   cargo run --release --bin rudp-server -- --bind 0.0.0.0:7777
//!
//!   # 10% 손실 + 20~80ms 지연 시뮬레이션
//!   cargo run --release --bin rudp-server -- --loss 0.1 --ping 20 80

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rudpkit::{BincodeCodec, Config, Event, Peer, Socket, UdpPlatform};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            config: Config::server(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--max-connections" | "-m" => {
                if i + 1 < args.len() {
                    config.config.connection_limit = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--window" => {
                if i + 1 < args.len() {
                    config.config.packet_window = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--loss" => {
                if i + 1 < args.len() {
                    config.config.simulated_loss = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--ping" => {
                if i + 2 < args.len() {
                    config.config.simulated_ping_min_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.config.simulated_ping_max_ms = args[i + 2].parse().expect("유효한 숫자 필요");
                    i += 2;
                }
            }
            "--manual-accept" => {
                config.config.auto_accept_incoming_connections = false;
            }
            "--help" | "-h" => {
                println!(
                    r#"rudp-server - rudpkit 채팅 중계 서버

받은 메시지를 연결된 모든 클라이언트에게 중계
- 손실 판정된 메시지는 재전송

사용법:
  cargo run --release --bin rudp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>           바인드 주소 (기본: 0.0.0.0:7777)
  -m, --max-connections <N>   최대 연결 수 (기본: 256)
  --window <N>                패킷 윈도우, 2의 거듭제곱 (기본: 512)
  --loss <RATIO>              시뮬레이션 손실률 0.0~1.0 (기본: 0)
  --ping <MIN> <MAX>          시뮬레이션 지연 범위 ms (기본: 끔)
  --manual-accept             연결 요청을 로그로 남기고 직접 수락
  -h, --help                  이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    let config = server_config.config.clone();

    info!("rudpkit server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Packet window: {}", config.packet_window);
    if config.simulated_loss > 0.0 || config.simulates_delay() {
        info!(
            "Simulation: loss {:.1}%, ping {}~{} ms",
            config.simulated_loss * 100.0,
            config.simulated_ping_min_ms,
            config.simulated_ping_max_ms
        );
    }

    let socket = Socket::new(UdpPlatform::new(), BincodeCodec::<String>::new(), config)?;
    socket.start(server_config.bind_addr);

    let mut clients: HashMap<SocketAddr, Peer> = HashMap::new();
    let mut last_report = Instant::now();

    loop {
        if let Some(event) = socket.wait(Duration::from_millis(100)) {
            match event {
                Event::Started(addr) => info!("Server listening on {}", addr),
                Event::StartFailed(reason) => {
                    warn!("Bind failed: {}", reason);
                    return Err(reason.into());
                }
                Event::ConnectRequest(addr) => {
                    info!("Accepting connection request from {}", addr);
                    socket.accept(addr);
                }
                Event::Connected(peer) => {
                    info!("Client connected: {}", peer);
                    clients.insert(peer.addr, peer);
                }
                Event::Disconnected(peer) => {
                    info!("Client disconnected: {}", peer);
                    clients.remove(&peer.addr);
                }
                Event::ObjectReceived { peer, object } => {
                    info!("[{}] {}", peer.addr, object);
                    let line = format!("{}: {}", peer.addr, object);
                    for client in clients.values() {
                        socket.send(*client, line.clone());
                    }
                }
                Event::ObjectLost { peer, object } => {
                    // 아직 연결 중이면 다시 보낸다
                    if clients.get(&peer.addr) == Some(&peer) {
                        socket.send(peer, object);
                    }
                }
                Event::ObjectSendFailed { peer, reason, .. } => {
                    warn!("Send to {} failed: {:?}", peer, reason);
                }
                Event::Stats(snapshot) => {
                    info!(
                        "{} | rtt {:.1} ms | window {:.0}% | {}",
                        snapshot.peer,
                        snapshot.network_ping * 1000.0,
                        snapshot.window_fill_ratio * 100.0,
                        snapshot.stats.summary()
                    );
                }
                _ => {}
            }
        }

        if last_report.elapsed() >= Duration::from_secs(10) {
            for client in clients.values() {
                socket.query_stats(*client);
            }
            last_report = Instant::now();
        }
    }
}
