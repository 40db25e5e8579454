//! 데이터그램 플랫폼
//!
//! 엔진은 원시 소켓을 `Platform` 트레이트로만 다룬다.
//! - `UdpPlatform`: OS UDP 소켓
//! - `MemoryNetwork`: 프로세스 내 가상 네트워크 (테스트용, 드롭 필터 지원)

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// 수신 임시 버퍼 크기 (UDP 최대 페이로드)
const MAX_DATAGRAM: usize = 65_536;

/// 원시 데이터그램 소켓
pub trait Platform: Send {
    /// 주소에 바인딩하고 실제 바인딩된 주소 반환
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr>;

    /// 바인딩된 로컬 주소
    fn local_addr(&self) -> Option<SocketAddr>;

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// 최대 `timeout` 동안 수신 대기. 읽을 데이터그램이 있으면 true
    fn recv_poll(&mut self, timeout: Duration) -> io::Result<bool>;

    /// 데이터그램 하나를 `buf`에 복사. 버퍼보다 긴 부분은 잘린다.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn close(&mut self) -> io::Result<()>;
}

fn not_bound() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is not bound")
}

/// OS UDP 소켓 플랫폼
#[derive(Debug, Default)]
pub struct UdpPlatform {
    socket: Option<UdpSocket>,
    buffer: Vec<u8>,
    /// recv_poll에서 미리 받아 둔 데이터그램 (길이, 송신자)
    pending: Option<(usize, SocketAddr)>,
}

impl UdpPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for UdpPlatform {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;
        self.socket = Some(socket);
        self.buffer = vec![0u8; MAX_DATAGRAM];
        self.pending = None;
        Ok(local)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let socket = self.socket.as_ref().ok_or_else(not_bound)?;
        socket.send_to(data, addr)
    }

    fn recv_poll(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }

        let socket = self.socket.as_ref().ok_or_else(not_bound)?;
        socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        match socket.recv_from(&mut self.buffer) {
            Ok(received) => {
                self.pending = Some(received);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.pending.is_none() && !self.recv_poll(Duration::from_millis(1))? {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram available"));
        }

        let (len, from) = self.pending.take().ok_or_else(not_bound)?;
        let copied = len.min(buf.len());
        buf[..copied].copy_from_slice(&self.buffer[..copied]);
        Ok((copied, from))
    }

    fn close(&mut self) -> io::Result<()> {
        self.socket = None;
        self.pending = None;
        Ok(())
    }
}

/// 드롭 필터: (데이터, 송신자, 수신자) -> 버릴지 여부
pub type DropFilter = Box<dyn FnMut(&[u8], SocketAddr, SocketAddr) -> bool + Send>;

struct Datagram {
    data: Vec<u8>,
    from: SocketAddr,
}

#[derive(Default)]
struct NetworkState {
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    next_port: u16,
}

struct NetworkInner {
    state: Mutex<NetworkState>,
    arrived: Condvar,
    filter: Mutex<Option<DropFilter>>,
}

/// 프로세스 내 가상 데이터그램 네트워크
///
/// 복제본은 같은 네트워크를 공유한다.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                state: Mutex::new(NetworkState {
                    queues: HashMap::new(),
                    next_port: 40_000,
                }),
                arrived: Condvar::new(),
                filter: Mutex::new(None),
            }),
        }
    }

    /// 이 네트워크에 붙는 새 플랫폼
    pub fn platform(&self) -> MemoryPlatform {
        MemoryPlatform {
            network: self.clone(),
            addr: None,
        }
    }

    /// 드롭 필터 설정. true를 반환한 데이터그램은 조용히 버려진다.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&[u8], SocketAddr, SocketAddr) -> bool + Send + 'static,
    {
        *self.inner.filter.lock() = Some(Box::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.inner.filter.lock() = None;
    }

    fn bind(&self, mut addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut state = self.inner.state.lock();
        if addr.ip().is_unspecified() {
            addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        if addr.port() == 0 {
            while state.queues.contains_key(&SocketAddr::new(addr.ip(), state.next_port)) {
                state.next_port = state.next_port.wrapping_add(1).max(1024);
            }
            addr.set_port(state.next_port);
            state.next_port = state.next_port.wrapping_add(1).max(1024);
        }

        if state.queues.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{} already bound", addr)));
        }

        state.queues.insert(addr, VecDeque::new());
        Ok(addr)
    }

    fn send(&self, data: &[u8], from: SocketAddr, to: SocketAddr) -> usize {
        if let Some(filter) = self.inner.filter.lock().as_mut() {
            if filter(data, from, to) {
                debug!("memory network: dropped {} bytes {} -> {}", data.len(), from, to);
                return data.len();
            }
        }

        let mut state = self.inner.state.lock();
        if let Some(queue) = state.queues.get_mut(&to) {
            queue.push_back(Datagram {
                data: data.to_vec(),
                from,
            });
            self.inner.arrived.notify_all();
        }
        data.len()
    }

    fn poll(&self, addr: SocketAddr, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            match state.queues.get(&addr) {
                None => return Err(not_bound()),
                Some(queue) if !queue.is_empty() => return Ok(true),
                Some(_) => {}
            }

            if self.inner.arrived.wait_until(&mut state, deadline).timed_out() {
                return Ok(state.queues.get(&addr).map_or(false, |q| !q.is_empty()));
            }
        }
    }

    fn take(&self, addr: SocketAddr, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut state = self.inner.state.lock();
        let queue = state.queues.get_mut(&addr).ok_or_else(not_bound)?;
        let datagram = queue
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no datagram available"))?;

        let copied = datagram.data.len().min(buf.len());
        buf[..copied].copy_from_slice(&datagram.data[..copied]);
        Ok((copied, datagram.from))
    }

    fn unbind(&self, addr: SocketAddr) {
        self.inner.state.lock().queues.remove(&addr);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// `MemoryNetwork`에 붙은 플랫폼
pub struct MemoryPlatform {
    network: MemoryNetwork,
    addr: Option<SocketAddr>,
}

impl Platform for MemoryPlatform {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let bound = self.network.bind(addr)?;
        self.addr = Some(bound);
        Ok(bound)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let from = self.addr.ok_or_else(not_bound)?;
        Ok(self.network.send(data, from, addr))
    }

    fn recv_poll(&mut self, timeout: Duration) -> io::Result<bool> {
        let addr = self.addr.ok_or_else(not_bound)?;
        self.network.poll(addr, timeout)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let addr = self.addr.ok_or_else(not_bound)?;
        self.network.take(addr, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(addr) = self.addr.take() {
            self.network.unbind(addr);
        }
        Ok(())
    }
}
