//! rudpkit 채팅 클라이언트
//!
//! 표준 입력 한 줄을 메시지 하나로 서버에 보내고, 서버가 중계한 메시지를 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin rudp-client -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin rudp-client -- --server 127.0.0.1:7777

use std::io::BufRead;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, TryRecvError};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rudpkit::{BincodeCodec, Config, Event, Peer, Socket, UdpPlatform};

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            config: Config::client(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--always-mtu" => {
                config.config.default_always_send_mtu = true;
            }
            "--loss" => {
                if i + 1 < args.len() {
                    config.config.simulated_loss = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"rudp-client - rudpkit 채팅 클라이언트

표준 입력 한 줄을 메시지 하나로 전송

사용법:
  cargo run --release --bin rudp-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:0)
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:7777)
  --always-mtu            객체 패킷을 항상 MTU 크기로 전송
  --loss <RATIO>          시뮬레이션 손실률 0.0~1.0 (기본: 0)
  -h, --help              이 도움말 출력
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

    let client_config = parse_args();

    info!("rudpkit client starting...");
    info!("Server address: {}", client_config.server_addr);

    let socket = Socket::new(UdpPlatform::new(), BincodeCodec::<String>::new(), client_config.config)?;
    socket.start(client_config.bind_addr);
    socket.connect(client_config.server_addr);

    // 표준 입력은 별도 스레드에서 읽는다
    let (line_tx, line_rx) = unbounded::<String>();
    thread::Builder::new().name("stdin".into()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    })?;

    let mut server: Option<Peer> = None;

    loop {
        while let Some(event) = socket.wait(Duration::from_millis(10)) {
            match event {
                Event::Started(addr) => info!("Bound to {}", addr),
                Event::StartFailed(reason) => return Err(reason.into()),
                Event::Connected(peer) => {
                    info!("Connected to {}", peer.addr);
                    server = Some(peer);
                }
                Event::ConnectFailed(addr) => return Err(format!("could not connect to {}", addr).into()),
                Event::ConnectRefused(addr) => return Err(format!("connection refused by {}", addr).into()),
                Event::Disconnected(_) => {
                    info!("Disconnected");
                    return Ok(());
                }
                Event::ObjectReceived { object, .. } => println!("{}", object),
                Event::ObjectLost { peer, object } => {
                    warn!("Message lost, resending: {}", object);
                    socket.send(peer, object);
                }
                Event::ObjectSendFailed { reason, .. } => warn!("Send failed: {:?}", reason),
                _ => {}
            }
        }

        match line_rx.try_recv() {
            Ok(line) => match server {
                Some(peer) if line == "/quit" => socket.disconnect(peer),
                Some(peer) => socket.send(peer, line),
                None => warn!("Not connected yet"),
            },
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                if let Some(peer) = server {
                    socket.disconnect(peer);
                }
                thread::sleep(Duration::from_millis(100));
                return Ok(());
            }
        }
    }
}
