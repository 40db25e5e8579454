//! 여러 소켓의 이벤트를 라운드로빈으로 모은다

use std::thread;
use std::time::{Duration, Instant};

use crate::codec::Codec;
use crate::event::Event;
use crate::socket::Socket;

/// 소켓 멀티플렉서
pub struct SocketMultiplexer<C: Codec> {
    sockets: Vec<Socket<C>>,
    cursor: usize,
}

impl<C: Codec> SocketMultiplexer<C> {
    pub fn new(sockets: Vec<Socket<C>>) -> Self {
        Self { sockets, cursor: 0 }
    }

    pub fn sockets(&self) -> &[Socket<C>] {
        &self.sockets
    }

    pub fn socket(&self, index: usize) -> Option<&Socket<C>> {
        self.sockets.get(index)
    }

    /// 직전에 이벤트를 낸 다음 소켓부터 한 바퀴 돌며 첫 이벤트를 반환
    pub fn poll(&mut self) -> Option<(usize, Event<C::Object>)> {
        let count = self.sockets.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if let Some(event) = self.sockets[index].poll() {
                self.cursor = (index + 1) % count;
                return Some((index, event));
            }
        }
        None
    }

    /// 이벤트가 올 때까지 최대 `timeout` 대기
    pub fn wait(&mut self, timeout: Duration) -> Option<(usize, Event<C::Object>)> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.poll() {
                return Some(found);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// 모든 소켓 종료 요청
    pub fn close(&self) {
        for socket in &self.sockets {
            socket.close();
        }
    }

    pub fn into_sockets(self) -> Vec<Socket<C>> {
        self.sockets
    }
}
