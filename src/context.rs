//! 네트워크 스레드 공유 자원
//!
//! 연결은 엔진을 역참조하지 않고, 호출마다 이 컨텍스트를 빌려 패킷을 보내고 이벤트를 올린다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::event::{Event, Mailbox};
use crate::header::HeaderLayout;
use crate::platform::Platform;
use crate::stats::LinkStats;
use crate::stream::BitStream;
use crate::Config;

/// 밀리초 시계 (엔진 생성 시점 기준)
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// 32비트에서 wrap되는 밀리초
    pub fn now_ms(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// `now`가 `deadline`에 도달했는지. 32비트 밀리초 시계가 wrap돼도 반 주기 안에서는 맞다.
#[inline]
pub fn time_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) as i32 >= 0
}

/// 네트워크 스레드 전용 컨텍스트
pub(crate) struct Context<T> {
    pub(crate) config: Config,
    pub(crate) layout: HeaderLayout,
    pub(crate) clock: Clock,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) events: Arc<Mailbox<Event<T>>>,
    /// 송신 스크래치 버퍼 (매 사용 전에 초기화)
    pub(crate) write_stream: BitStream,
    /// 소켓 전체 통계
    pub(crate) stats: LinkStats,
    /// 소켓이 Created/Running일 때만 송신
    pub(crate) can_send: bool,
}

impl<T> Context<T> {
    pub(crate) fn new(config: Config, platform: Box<dyn Platform>, events: Arc<Mailbox<Event<T>>>) -> Self {
        let layout = HeaderLayout::from_config(&config);
        let write_stream = BitStream::with_length(config.recv_buffer_size() << 3);

        Self {
            config,
            layout,
            clock: Clock::new(),
            platform,
            events,
            write_stream,
            stats: LinkStats::new(),
            can_send: true,
        }
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now_ms()
    }

    pub(crate) fn raise(&self, event: Event<T>) {
        self.events.push(event);
    }

    /// 스크래치 버퍼를 쓰기용으로 초기화 (`offset_bits`부터 페이로드)
    pub(crate) fn write_stream(&mut self, length_bits: usize, offset_bits: usize) -> &mut BitStream {
        self.write_stream.reset_for_write(length_bits, offset_bits);
        &mut self.write_stream
    }

    /// 스크래치 버퍼 앞 `len` 바이트 전송
    pub(crate) fn send(&mut self, addr: SocketAddr, len: usize) -> bool {
        if !self.can_send {
            return false;
        }

        let data = self.write_stream.data();
        let len = len.min(data.len());
        match self.platform.send_to(&data[..len], addr) {
            Ok(_) => true,
            Err(e) => {
                warn!("send to {} failed: {}", addr, e);
                false
            }
        }
    }
}
