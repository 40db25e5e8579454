//! # rudpkit
//!
//! UDP 위의 시퀀스/ack 추적형 객체 전송 라이브러리 (실시간 게임용)
//!
//! ## 핵심 특징
//! - **선택적 ack**: 헤더의 ack history 비트맵으로 최근 N개 패킷의 수신 여부를 매번 전달
//! - **손실 가시성**: 보낸 객체마다 전달(delivered) 또는 손실(lost) 이벤트가 정확히 하나
//! - **전용 네트워크 스레드**: 모든 연결 상태는 한 스레드가 소유, 메일박스 두 개로만 통신
//! - **RTT/시계 추정**: aliased/network RTT 이동 평균과 서버 시계 오프셋
//! - **플러그형 플랫폼/코덱**: `Platform`, `Codec` 트레이트로 소켓과 직렬화 교체
//!
//! ## 사용 예
//! ```no_run
//! use std::time::Duration;
//! use rudpkit::{BytesCodec, Config, Event, Socket, UdpPlatform};
//!
//! let socket = Socket::new(UdpPlatform::new(), BytesCodec, Config::client()).unwrap();
//! socket.start("0.0.0.0:0".parse().unwrap());
//! socket.connect("127.0.0.1:7777".parse().unwrap());
//!
//! while let Some(event) = socket.wait(Duration::from_secs(1)) {
//!     if let Event::Connected(peer) = event {
//!         socket.send(peer, bytes::Bytes::from_static(b"hello"));
//!     }
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod event;
pub mod header;
pub mod multiplexer;
pub mod platform;
pub mod recv_window;
pub mod reliable;
pub mod send_window;
pub mod sequence;
pub mod simulation;
pub mod socket;
pub mod stats;
pub mod stream;

pub use codec::{BincodeCodec, BytesCodec, Codec};
pub use config::{Config, NoiseFn, RttSource};
pub use connection::{ConnectionMode, ConnectionState};
pub use context::Clock;
pub use error::{Error, Result};
pub use event::{Command, ConnectionId, ConnectionOption, ConnectionSnapshot, Event, Mailbox, Peer, SendFailReason};
pub use multiplexer::SocketMultiplexer;
pub use platform::{MemoryNetwork, MemoryPlatform, Platform, UdpPlatform};
pub use recv_window::{RecvOutcome, RecvWindow};
pub use reliable::ReliableBuffer;
pub use send_window::{SendWindow, SlotState};
pub use sequence::Sequenced;
pub use socket::{Socket, SocketState};
pub use stats::LinkStats;
pub use stream::{BitStream, BufferPool};

/// 기본 패킷 크기 (바이트)
pub const DEFAULT_PACKET_SIZE: usize = 1024;
