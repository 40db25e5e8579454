//! 명령/이벤트 메일박스
//!
//! 애플리케이션 스레드와 네트워크 스레드 사이의 유일한 통로.
//! - 명령 메일박스: 애플리케이션 -> 네트워크 스레드
//! - 이벤트 메일박스: 네트워크 스레드 -> 애플리케이션

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::connection::{ConnectionMode, ConnectionState};
use crate::stats::LinkStats;

/// 연결 식별자 (소켓 내에서 유일)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 명령과 이벤트에서 연결을 가리키는 핸들
///
/// 같은 주소로 재연결하면 id가 달라지므로 이전 연결에 대한 명령은 무시된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: ConnectionId,
    pub addr: SocketAddr,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.addr, self.id)
    }
}

/// 연결별 옵션
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOption {
    /// 객체 패킷을 항상 MTU 크기로 보냄
    AlwaysSendMtu(bool),
}

/// 객체 송신 실패 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailReason {
    /// 연결되지 않음
    NotConnected,

    /// 송신 윈도우가 가득 참
    PacketWindowFull,

    /// 직렬화 결과가 패킷 크기를 넘음
    StreamOverflow,

    /// 코덱이 실패함
    SerializerFailed,

    /// 플랫폼 송신 실패 (객체는 윈도우에 남아 ack/손실 판정을 기다림)
    SocketError,
}

/// 연결 상태 스냅샷 (`Command::QueryStats` 응답)
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub peer: Peer,
    pub mode: ConnectionMode,
    pub state: ConnectionState,
    pub mtu: usize,

    /// 네트워크 RTT (초)
    pub network_ping: f32,

    /// aliased RTT (초)
    pub aliased_ping: f32,

    /// 원격 시계 추정치 (ms)
    pub remote_time: u32,

    /// 송신 윈도우 점유율
    pub window_fill_ratio: f32,

    pub stats: LinkStats,
}

/// 애플리케이션 -> 네트워크 스레드 명령
#[derive(Debug)]
pub enum Command<T> {
    Start(SocketAddr),
    Connect(SocketAddr),
    CancelConnect(SocketAddr),
    Accept(SocketAddr),
    Refuse(SocketAddr),
    Disconnect(Peer),
    Close,
    Send(Peer, T),
    SetOption(Peer, ConnectionOption),
    /// 네트워크 스레드를 잠시 멈춤 (디버그용)
    Sleep(Duration),
    QueryStats(Peer),
}

/// 네트워크 스레드 -> 애플리케이션 이벤트
#[derive(Debug, Clone)]
pub enum Event<T> {
    /// 바인딩 성공
    Started(SocketAddr),

    /// 바인딩 실패
    StartFailed(String),

    Connected(Peer),
    Disconnected(Peer),

    /// 재시도를 모두 소진했거나 취소됨
    ConnectFailed(SocketAddr),

    /// 서버가 거절함
    ConnectRefused(SocketAddr),

    /// 수락/거절을 기다리는 연결 요청
    ConnectRequest(SocketAddr),

    ObjectReceived { peer: Peer, object: T },
    ObjectSent { peer: Peer, object: T },
    ObjectSendFailed { peer: Peer, object: T, reason: SendFailReason },
    ObjectLost { peer: Peer, object: T },
    ObjectDelivered { peer: Peer, object: T },

    Stats(ConnectionSnapshot),
}

/// mutex 보호 FIFO 메일박스
///
/// 신호를 켜면 push마다 auto-reset 신호(용량 1 채널)를 올려 `wait`가 바쁜 대기 없이 깨어난다.
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    signal: Option<(Sender<()>, Receiver<()>)>,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize, use_signal: bool) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            signal: use_signal.then(|| bounded(1)),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);

        if let Some((tx, _)) = &self.signal {
            // 이미 신호가 올라가 있으면 그대로 둔다
            let _ = tx.try_send(());
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// 항목이 생길 때까지 최대 `timeout` 대기
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.pop() {
            return Some(item);
        }

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let now = std::time::Instant::now();
            if now >= deadline {
                return self.pop();
            }

            match &self.signal {
                Some((_, rx)) => {
                    let _ = rx.recv_timeout(deadline - now);
                }
                None => std::thread::sleep((deadline - now).min(Duration::from_millis(1))),
            }

            if let Some(item) = self.pop() {
                return Some(item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo() {
        let mailbox = Mailbox::new(4, false);
        for i in 0..10 {
            mailbox.push(i);
        }
        assert_eq!(mailbox.len(), 10);

        let drained: Vec<i32> = std::iter::from_fn(|| mailbox.pop()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let mailbox = Arc::new(Mailbox::new(4, true));
        let producer = Arc::clone(&mailbox);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(7u32);
        });

        let started = Instant::now();
        assert_eq!(mailbox.wait(Duration::from_secs(5)), Some(7));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let mailbox: Mailbox<u8> = Mailbox::new(1, false);
        assert_eq!(mailbox.wait(Duration::from_millis(5)), None);
    }
}
