//! 소켓 설정

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::send_window::{check_capacity, MAX_WINDOW, MIN_WINDOW};
use crate::sequence::SEQUENCE_BITS;
use crate::{Error, Result, DEFAULT_PACKET_SIZE};

/// 원격 시계 보정에 사용할 RTT 추정치
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RttSource {
    /// 원격 처리 지연을 뺀 순수 네트워크 RTT
    Network,

    /// 원격 처리 지연을 포함한 RTT
    Aliased,
}

/// 시뮬레이션 난수 대체 함수. 0.0 ~ 1.0 값을 돌려줘야 한다.
///
/// 지정하면 손실 판정과 지연 계산에 내부 난수 대신 사용된다.
#[derive(Clone)]
pub struct NoiseFn(Arc<dyn Fn() -> f32 + Send + Sync>);

impl NoiseFn {
    pub fn new(noise: impl Fn() -> f32 + Send + Sync + 'static) -> Self {
        Self(Arc::new(noise))
    }

    /// 0.0 ~ 1.0으로 잘라낸 값
    pub fn sample(&self) -> f32 {
        let value = (self.0)();
        if value.is_nan() {
            return 0.0;
        }
        value.clamp(0.0, 1.0)
    }
}

impl fmt::Debug for NoiseFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoiseFn(..)")
    }
}

/// rudpkit 소켓 설정
///
/// 소켓 생성 시 복사되어 네트워크 스레드가 단독으로 소유한다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 패킷 크기 (바이트), 새 연결의 MTU
    pub packet_size: usize,

    /// 새 연결의 초기 네트워크 RTT (초)
    pub default_network_ping: f32,

    /// 새 연결의 초기 aliased RTT (초)
    pub default_aliased_ping: f32,

    /// 객체 패킷을 항상 MTU 크기로 채워 보낼지 (연결별 옵션 기본값)
    pub default_always_send_mtu: bool,

    /// 직렬화 결과가 MTU를 넘어도 보낼지
    pub allow_packet_overflow: bool,

    /// 이벤트 push마다 auto-reset 신호를 올릴지
    pub use_available_event_signal: bool,

    /// 왕복 힌트 상한 (밀리초)
    pub max_ping_ms: u32,

    /// 연결 요청 재시도 간격 (밀리초)
    pub connect_request_timeout_ms: u32,

    /// 연결 요청 최대 시도 횟수
    pub connect_request_attempts: u32,

    /// 수신이 없을 때 연결을 끊기까지의 시간 (밀리초)
    pub connection_timeout_ms: u32,

    /// 송신이 없을 때 ping을 보내는 간격 (밀리초)
    pub ping_timeout_ms: u32,

    /// ack 없이 받을 수 있는 패킷 수. 넘으면 ping으로 ack 강제
    pub recv_without_ack_limit: u32,

    /// 패킷 윈도우 (2의 거듭제곱, 4 ~ 16384)
    pub packet_window: usize,

    /// 최대 연결 수 (None이면 무제한)
    pub connection_limit: Option<usize>,

    /// 들어오는 연결 허용
    pub allow_incoming_connections: bool,

    /// 여유가 있으면 들어오는 연결 자동 수락
    pub auto_accept_incoming_connections: bool,

    /// Accepted 명령이 유실돼도 서버 패킷을 받으면 연결된 것으로 간주
    pub allow_implicit_accept: bool,

    /// 메일박스 초기 용량
    pub initial_event_queue_size: usize,

    /// ack history 비트 수 (1 ~ 64)
    pub ack_redundancy: u32,

    /// 헤더에 왕복 힌트 포함
    pub round_trip_hint: bool,

    /// 원격 시계 보정 기준 RTT
    pub authoritative_rtt: RttSource,

    /// 시뮬레이션 손실률 (0.0 ~ 1.0), 디버그용
    pub simulated_loss: f32,

    /// 시뮬레이션 최소 지연 (밀리초), 디버그용
    pub simulated_ping_min_ms: u32,

    /// 시뮬레이션 최대 지연 (밀리초), 디버그용
    pub simulated_ping_max_ms: u32,

    /// 시뮬레이션 난수 대체 함수, 디버그용
    #[serde(skip)]
    pub simulated_noise: Option<NoiseFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            default_network_ping: 0.1,
            default_aliased_ping: 0.15,
            default_always_send_mtu: false,
            allow_packet_overflow: false,
            use_available_event_signal: true,
            max_ping_ms: 4000,
            connect_request_timeout_ms: 1000,
            connect_request_attempts: 5,
            connection_timeout_ms: 5000,
            ping_timeout_ms: 100,
            recv_without_ack_limit: 8,
            packet_window: 256,
            connection_limit: Some(64),
            allow_incoming_connections: true,
            auto_accept_incoming_connections: true,
            allow_implicit_accept: true,
            initial_event_queue_size: 4096,
            ack_redundancy: 64,
            round_trip_hint: true,
            authoritative_rtt: RttSource::Network,
            simulated_loss: 0.0,
            simulated_ping_min_ms: 0,
            simulated_ping_max_ms: 0,
            simulated_noise: None,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 전용 서버용 설정
    pub fn server() -> Self {
        Self {
            connection_limit: Some(256),
            packet_window: 512,
            initial_event_queue_size: 16384,
            ..Self::default()
        }
    }

    /// 클라이언트용 설정 (들어오는 연결 거부)
    pub fn client() -> Self {
        Self {
            connection_limit: Some(1),
            allow_incoming_connections: false,
            auto_accept_incoming_connections: false,
            initial_event_queue_size: 1024,
            ..Self::default()
        }
    }

    /// 손실/지연 시뮬레이션 설정
    pub fn lossy(loss: f32, ping_min_ms: u32, ping_max_ms: u32) -> Self {
        Self {
            simulated_loss: loss,
            simulated_ping_min_ms: ping_min_ms,
            simulated_ping_max_ms: ping_max_ms,
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if !(MIN_WINDOW..=MAX_WINDOW).contains(&self.packet_window) {
            return Err(Error::InvalidWindow {
                capacity: self.packet_window,
            });
        }
        check_capacity(self.packet_window, SEQUENCE_BITS)?;

        if !(1..=64).contains(&self.ack_redundancy) {
            return Err(Error::InvalidConfig(format!(
                "ack_redundancy는 1 ~ 64 사이여야 함: {}",
                self.ack_redundancy
            )));
        }

        let header_bytes = crate::stream::bytes_required(self.max_header_bits());
        if self.packet_size <= header_bytes + 1 {
            return Err(Error::InvalidConfig(format!(
                "packet_size({})가 헤더 크기({} bytes)보다 커야 함",
                self.packet_size, header_bytes
            )));
        }

        if !(0.0..=1.0).contains(&self.simulated_loss) {
            return Err(Error::InvalidConfig(format!(
                "simulated_loss는 0.0 ~ 1.0 사이여야 함: {}",
                self.simulated_loss
            )));
        }

        if self.initial_event_queue_size == 0 {
            return Err(Error::InvalidConfig("initial_event_queue_size는 0보다 커야 함".into()));
        }

        Ok(())
    }

    /// 시계 필드를 포함한 최대 헤더 크기 (비트)
    pub fn max_header_bits(&self) -> usize {
        crate::header::HeaderLayout::from_config(self).bit_size(true)
    }

    /// 지연 시뮬레이션 활성 여부
    pub fn simulates_delay(&self) -> bool {
        self.simulated_ping_min_ms > 0
            && self.simulated_ping_max_ms > 0
            && self.simulated_ping_min_ms < self.simulated_ping_max_ms
    }

    /// 수신 버퍼 크기 (오버플로우 허용 시 여유분 포함)
    pub fn recv_buffer_size(&self) -> usize {
        self.packet_size * 2
    }
}
