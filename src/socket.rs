//! 소켓 엔진
//!
//! 전용 네트워크 스레드 하나가 모든 연결, 윈도우, 원시 소켓을 소유한다.
//! 애플리케이션과는 명령/이벤트 메일박스 두 개로만 통신한다.
//!
//! 루프 (Running):
//! 1. 지연 시뮬레이션 패킷 전달
//! 2. 데이터그램 수신 (최대 1ms 대기)
//! 3. 4 프레임마다 타임아웃 스윕
//! 4. 명령 메일박스 비우기

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::connection::{Connection, ConnectionMode, ConnectionState};
use crate::context::Context;
use crate::event::{Command, ConnectionId, ConnectionOption, Event, Mailbox, Peer, SendFailReason};
use crate::header::{CommandType, Header, COMMAND_BITS};
use crate::platform::Platform;
use crate::sequence::SEQUENCE_MASK;
use crate::simulation::Simulator;
use crate::stream::{bytes_required, BitStream};
use crate::{Config, Error, Result};

/// 수신 대기 시간
const RECV_POLL: Duration = Duration::from_millis(1);

/// 엔진 상태 (단조 전이, 재사용 없음)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Running,
    Shutdown,
}

/// 네트워크 스레드가 소유하는 엔진
pub(crate) struct Engine<C: Codec> {
    state: SocketState,
    frame: u32,
    codec: C,
    ctx: Context<C::Object>,
    commands: Arc<Mailbox<Command<C::Object>>>,
    read_stream: BitStream,
    connections: HashMap<SocketAddr, Connection<C>>,
    /// 타임아웃 스윕 순서
    order: Vec<SocketAddr>,
    /// 수동 수락 대기 중인 요청과 마지막 요청 시각
    pending: HashMap<SocketAddr, u32>,
    next_id: u64,
    simulator: Simulator,
}

impl<C: Codec> Engine<C> {
    pub(crate) fn new(
        platform: Box<dyn Platform>,
        codec: C,
        config: Config,
        commands: Arc<Mailbox<Command<C::Object>>>,
        events: Arc<Mailbox<Event<C::Object>>>,
    ) -> Self {
        let simulator = Simulator::new(&config);
        let read_stream = BitStream::with_length(config.recv_buffer_size() << 3);

        Self {
            state: SocketState::Created,
            frame: 0,
            codec,
            ctx: Context::new(config, platform, events),
            commands,
            read_stream,
            connections: HashMap::new(),
            order: Vec::new(),
            pending: HashMap::new(),
            next_id: 0,
            simulator,
        }
    }

    /// 네트워크 스레드 진입점. 패닉이 나면 로그를 남기고 재시작한다.
    pub(crate) fn run(mut self) {
        loop {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.network_loop()));

            match result {
                Ok(()) => break,
                Err(cause) => {
                    let message = cause
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| cause.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("network loop panicked: {}", message);

                    if self.state == SocketState::Shutdown {
                        break;
                    }
                }
            }
        }
    }

    fn network_loop(&mut self) {
        info!("socket created");
        while self.state == SocketState::Created {
            self.process_commands(true);
            if self.state == SocketState::Created {
                thread::sleep(Duration::from_millis(1));
            }
        }

        if self.state == SocketState::Running {
            info!("socket started");
        }

        while self.state == SocketState::Running {
            self.recv_delayed_packets();
            self.recv_network_data();
            self.process_timeouts();
            self.process_commands(false);
            self.frame = self.frame.wrapping_add(1);
        }

        info!("socket closed | {}", self.ctx.stats.summary());
    }

    /// 명령 메일박스를 비운다. `return_on_start`면 Start 처리 직후 반환
    fn process_commands(&mut self, return_on_start: bool) {
        while let Some(command) = self.commands.pop() {
            match command {
                Command::Start(addr) => {
                    self.on_start(addr);
                    if return_on_start {
                        return;
                    }
                }
                Command::Connect(addr) => self.on_connect(addr),
                Command::CancelConnect(addr) => self.on_cancel_connect(addr),
                Command::Accept(addr) => {
                    if self.pending.remove(&addr).is_some() {
                        self.accept_connection(addr);
                    }
                }
                Command::Refuse(addr) => {
                    if self.pending.remove(&addr).is_some() {
                        self.send_refused(addr);
                    }
                }
                Command::Disconnect(peer) => {
                    if let Some(conn) = Self::lookup(&mut self.connections, peer) {
                        conn.disconnect(&mut self.ctx);
                    }
                }
                Command::Close => self.on_close(),
                Command::Send(peer, object) => self.on_send(peer, object),
                Command::SetOption(peer, option) => self.on_set_option(peer, option),
                Command::Sleep(duration) => {
                    debug!("sleeping network thread for {:?}", duration);
                    thread::sleep(duration);
                }
                Command::QueryStats(peer) => {
                    let now = self.ctx.now();
                    if let Some(conn) = Self::lookup(&mut self.connections, peer) {
                        self.ctx.raise(Event::Stats(conn.snapshot(now)));
                    }
                }
            }

            if self.state == SocketState::Shutdown {
                return;
            }
        }
    }

    /// id까지 일치하는 연결만 반환 (같은 주소의 이전 연결에 대한 명령 무시)
    fn lookup(connections: &mut HashMap<SocketAddr, Connection<C>>, peer: Peer) -> Option<&mut Connection<C>> {
        connections.get_mut(&peer.addr).filter(|conn| conn.id() == peer.id)
    }

    fn on_start(&mut self, addr: SocketAddr) {
        if self.state != SocketState::Created {
            warn!("start ignored, socket is {:?}", self.state);
            return;
        }

        match self.ctx.platform.bind(addr) {
            Ok(bound) => {
                self.state = SocketState::Running;
                info!("socket bound to {}", bound);
                self.ctx.raise(Event::Started(bound));
            }
            Err(e) => {
                error!("could not bind socket to {}: {}", addr, e);
                self.ctx.raise(Event::StartFailed(e.to_string()));
            }
        }
    }

    fn on_connect(&mut self, addr: SocketAddr) {
        if self.state != SocketState::Running {
            warn!("connect to {} ignored, socket is not running", addr);
            self.ctx.raise(Event::ConnectFailed(addr));
            return;
        }

        match self.create_connection(addr, ConnectionMode::Client) {
            Ok(()) => info!("connecting to {}", addr),
            Err(e) => {
                error!("could not create connection: {}", e);
                self.ctx.raise(Event::ConnectFailed(addr));
            }
        }
    }

    fn on_cancel_connect(&mut self, addr: SocketAddr) {
        if let Some(conn) = self.connections.get_mut(&addr) {
            conn.cancel_connect(&mut self.ctx);
        }
    }

    fn on_close(&mut self) {
        if self.state == SocketState::Shutdown {
            return;
        }

        let was_running = self.state == SocketState::Running;
        for addr in &self.order {
            if let Some(conn) = self.connections.get_mut(addr) {
                conn.disconnect(&mut self.ctx);
            }
        }

        self.state = SocketState::Shutdown;
        self.ctx.can_send = false;

        if was_running {
            if let Err(e) = self.ctx.platform.close() {
                error!("failed to shut down socket: {}", e);
            }
        }

        self.connections.clear();
        self.order.clear();
        self.pending.clear();
        self.commands.clear();
        self.simulator.clear();
    }

    fn on_send(&mut self, peer: Peer, object: C::Object) {
        match Self::lookup(&mut self.connections, peer) {
            Some(conn) => conn.send_object(&mut self.ctx, object),
            None => self.ctx.raise(Event::ObjectSendFailed {
                peer,
                object,
                reason: SendFailReason::NotConnected,
            }),
        }
    }

    fn on_set_option(&mut self, peer: Peer, option: ConnectionOption) {
        if let Some(conn) = Self::lookup(&mut self.connections, peer) {
            conn.set_option(option);
        }
    }

    fn create_connection(&mut self, addr: SocketAddr, mode: ConnectionMode) -> Result<()> {
        if self.connections.contains_key(&addr) {
            warn!("connection for {} already exists", addr);
            return Err(Error::ConnectionExists(addr));
        }

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        let conn = Connection::new(id, mode, addr, self.codec.clone(), &self.ctx)?;

        self.order.push(addr);
        self.connections.insert(addr, conn);
        Ok(())
    }

    fn accept_connection(&mut self, addr: SocketAddr) {
        if let Err(e) = self.create_connection(addr, ConnectionMode::Server) {
            error!("could not accept {}: {}", addr, e);
            return;
        }

        if let Some(conn) = self.connections.get_mut(&addr) {
            conn.change_state(&mut self.ctx, ConnectionState::Connected);
        }
    }

    /// 미연결 주소에 거절 명령 전송 (seq 0, ack = mask, history 0, 시계 포함)
    fn send_refused(&mut self, addr: SocketAddr) {
        let header_bits = self.ctx.layout.bit_size(true);
        let length = self.ctx.config.packet_size << 3;
        let stream = self.ctx.write_stream(length, header_bits);
        stream.write_u8(CommandType::Refused as u8, COMMAND_BITS);

        let header = Header {
            object_sequence: 0,
            ack_sequence: SEQUENCE_MASK,
            ack_history: 0,
            ack_time: 0,
            is_object: false,
            clock: Some(self.ctx.now()),
        };
        header.pack(&mut self.ctx.write_stream, &self.ctx.layout);

        let bytes = bytes_required(self.ctx.write_stream.position());
        if self.ctx.send(addr, bytes) {
            debug!("refused connection from {}", addr);
        }
    }

    fn process_timeouts(&mut self) {
        if self.frame & 3 != 3 {
            return;
        }

        let now = self.ctx.now();
        self.expire_pending(now);

        let mut i = 0;
        while i < self.order.len() {
            let addr = self.order[i];
            let Some(conn) = self.connections.get_mut(&addr) else {
                self.order.remove(i);
                continue;
            };

            match conn.state() {
                ConnectionState::Connecting => conn.process_connecting_timeouts(&mut self.ctx, now),
                ConnectionState::Connected => conn.process_connected_timeouts(&mut self.ctx, now),
                ConnectionState::Disconnected => conn.change_state(&mut self.ctx, ConnectionState::Destroy),
                ConnectionState::Destroy => {
                    debug!("destroying connection to {}", addr);
                    self.connections.remove(&addr);
                    self.order.remove(i);
                    continue;
                }
            }
            i += 1;
        }
    }

    /// 재시도가 두 번 연속 끊긴 연결 요청은 잊는다 (클라이언트가 포기했거나 사라짐)
    fn expire_pending(&mut self, now: u32) {
        let expiry = self.ctx.config.connect_request_timeout_ms.saturating_mul(2);
        self.pending.retain(|addr, requested| {
            let alive = now.wrapping_sub(*requested) <= expiry;
            if !alive {
                debug!("connection request from {} expired", addr);
            }
            alive
        });
    }

    fn recv_network_data(&mut self) {
        match self.ctx.platform.recv_poll(RECV_POLL) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("recv poll failed: {}", e);
                thread::sleep(RECV_POLL);
                return;
            }
        }

        let capacity = self.ctx.config.recv_buffer_size();
        let buffer = self.read_stream.raw_mut(capacity);
        let (len, addr) = match self.ctx.platform.recv_from(buffer) {
            Ok(received) => received,
            Err(e) => {
                debug!("recv failed: {}", e);
                return;
            }
        };

        if self.simulator.should_drop() {
            return;
        }

        let now = self.ctx.now();
        if self.simulator.delay(addr, &self.read_stream.data()[..len], now) {
            return;
        }

        self.recv_packet(addr, len);
    }

    fn recv_delayed_packets(&mut self) {
        let now = self.ctx.now();
        while let Some(packet) = self.simulator.pop_due(now) {
            let buffer = self.read_stream.raw_mut(packet.len);
            buffer.copy_from_slice(&packet.data[..packet.len]);

            let (addr, len) = (packet.addr, packet.len);
            self.simulator.recycle(packet);
            self.recv_packet(addr, len);
        }
    }

    /// `read_stream` 앞 `len` 바이트를 연결 또는 미연결 처리로 넘긴다
    fn recv_packet(&mut self, addr: SocketAddr, len: usize) {
        self.read_stream.reset_for_read(len);
        if len == 0 {
            return;
        }

        match self.connections.get_mut(&addr) {
            Some(conn) => conn.on_packet(&mut self.ctx, &mut self.read_stream),
            None => self.recv_unconnected(addr),
        }
    }

    fn recv_unconnected(&mut self, addr: SocketAddr) {
        let header_bits = self.ctx.layout.bit_size(false);
        let expected = bytes_required(header_bits + COMMAND_BITS as usize);
        let data = self.read_stream.data();

        // 클라이언트의 Connect 명령만 받는다
        if Header::peek_is_object(data) || data.len() != expected {
            debug!("ignoring unconnected packet from {} ({} bytes)", addr, data.len());
            return;
        }

        self.read_stream.set_position(header_bits);
        match self.read_stream.read_u8(COMMAND_BITS).map(CommandType::try_from) {
            Ok(Ok(CommandType::Connect)) => {}
            _ => return,
        }

        let now = self.ctx.now();
        // 대기 중인 요청의 재시도
        if let Some(requested) = self.pending.get_mut(&addr) {
            *requested = now;
            return;
        }

        let config = &self.ctx.config;
        let under_limit = config
            .connection_limit
            .map_or(true, |limit| self.connections.len() + self.pending.len() < limit);

        if config.allow_incoming_connections && under_limit {
            if config.auto_accept_incoming_connections {
                self.accept_connection(addr);
            } else {
                self.pending.insert(addr, now);
                info!("connection request from {}", addr);
                self.ctx.raise(Event::ConnectRequest(addr));
            }
        } else {
            self.send_refused(addr);
        }
    }
}

/// 애플리케이션측 소켓 핸들
///
/// 모든 메서드는 명령을 메일박스에 넣고 즉시 반환한다. 결과는 `poll`/`wait`로 받는 이벤트로 온다.
pub struct Socket<C: Codec> {
    commands: Arc<Mailbox<Command<C::Object>>>,
    events: Arc<Mailbox<Event<C::Object>>>,
    thread: Option<JoinHandle<()>>,
}

impl<C: Codec> Socket<C> {
    /// 소켓 생성과 네트워크 스레드 시작 (바인딩은 `start`)
    pub fn new<P: Platform + 'static>(platform: P, codec: C, config: Config) -> Result<Self> {
        config.validate()?;

        let capacity = config.initial_event_queue_size;
        let commands = Arc::new(Mailbox::new(capacity, false));
        let events = Arc::new(Mailbox::new(capacity, config.use_available_event_signal));

        let engine = Engine::new(
            Box::new(platform),
            codec,
            config,
            Arc::clone(&commands),
            Arc::clone(&events),
        );

        let thread = thread::Builder::new()
            .name("rudpkit-network".into())
            .spawn(move || engine.run())?;

        Ok(Self {
            commands,
            events,
            thread: Some(thread),
        })
    }

    fn raise(&self, command: Command<C::Object>) {
        self.commands.push(command);
    }

    /// 주소에 바인딩하고 루프 시작. 결과는 Started / StartFailed 이벤트
    pub fn start(&self, addr: SocketAddr) {
        self.raise(Command::Start(addr));
    }

    pub fn connect(&self, addr: SocketAddr) {
        self.raise(Command::Connect(addr));
    }

    pub fn cancel_connect(&self, addr: SocketAddr) {
        self.raise(Command::CancelConnect(addr));
    }

    /// ConnectRequest로 받은 대기 요청 수락
    pub fn accept(&self, addr: SocketAddr) {
        self.raise(Command::Accept(addr));
    }

    pub fn refuse(&self, addr: SocketAddr) {
        self.raise(Command::Refuse(addr));
    }

    pub fn disconnect(&self, peer: Peer) {
        self.raise(Command::Disconnect(peer));
    }

    pub fn send(&self, peer: Peer, object: C::Object) {
        self.raise(Command::Send(peer, object));
    }

    pub fn set_option(&self, peer: Peer, option: ConnectionOption) {
        self.raise(Command::SetOption(peer, option));
    }

    /// 네트워크 스레드를 잠시 멈춤 (디버그용)
    pub fn sleep(&self, duration: Duration) {
        self.raise(Command::Sleep(duration));
    }

    /// 연결 스냅샷 요청. 결과는 Stats 이벤트
    pub fn query_stats(&self, peer: Peer) {
        self.raise(Command::QueryStats(peer));
    }

    pub fn close(&self) {
        self.raise(Command::Close);
    }

    /// 이벤트 하나 (대기 없음)
    pub fn poll(&self) -> Option<Event<C::Object>> {
        self.events.pop()
    }

    /// 이벤트가 올 때까지 최대 `timeout` 대기
    pub fn wait(&self, timeout: Duration) -> Option<Event<C::Object>> {
        self.events.wait(timeout)
    }
}

impl<C: Codec> Drop for Socket<C> {
    fn drop(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("network thread terminated abnormally");
            }
        }
    }
}
