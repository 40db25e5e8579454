//! 연결 상태 기계
//!
//! 하나의 원격 주소에 대한 송신 윈도우, ack 기록, RTT/시계 추정, 명령 처리를 담당한다.
//! 네트워크 스레드만 접근하며 내부 잠금은 없다.
//!
//! ```text
//! Connecting ──> Connected ──> Disconnected ──> Destroy
//!      └──────────────────────────────────────────┘ (실패/취소/거절)
//! ```

use std::net::SocketAddr;

use tracing::{debug, error, info};

use crate::codec::Codec;
use crate::config::RttSource;
use crate::context::{time_reached, Context};
use crate::event::{ConnectionId, ConnectionOption, ConnectionSnapshot, Event, Peer, SendFailReason};
use crate::header::{CommandType, Header, COMMAND_BITS};
use crate::send_window::SendWindow;
use crate::sequence::{self, Sequenced, SEQUENCE_BITS, SEQUENCE_MASK};
use crate::stats::LinkStats;
use crate::stream::{bytes_required, BitStream};
use crate::Result;

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// 다음 타임아웃 스윕에서 제거됨
    Destroy,
}

/// 연결 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Client,
    Server,
}

/// 프로토콜 오류 (항상 Disconnected로 전이)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    SequenceOutOfBounds,
    IncorrectCommand,
    SendWindowFull,
}

/// 송신 윈도우 엔트리
#[derive(Debug, Clone)]
pub(crate) struct Handle<T> {
    sequence: u32,
    send_time: u32,
    /// 명령 패킷이면 None
    object: Option<T>,
}

impl<T> Sequenced for Handle<T> {
    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }
}

/// 연결
pub struct Connection<C: Codec> {
    id: ConnectionId,
    mode: ConnectionMode,
    state: ConnectionState,
    addr: SocketAddr,
    mtu: usize,
    always_send_mtu: bool,
    codec: C,

    send_window: SendWindow<Handle<C::Object>>,
    send_time: u32,
    /// 송신 윈도우가 처음 가득 찬 시각
    window_full_since: Option<u32>,

    recv_time: u32,
    recv_sequence: u32,
    recv_history: u64,
    recv_since_last_send: u32,

    connect_deadline: Option<u32>,
    connect_attempts: u32,

    network_rtt: f32,
    aliased_rtt: f32,
    remote_time_offset: u32,

    stats: LinkStats,
}

impl<C: Codec> Connection<C> {
    pub(crate) fn new(
        id: ConnectionId,
        mode: ConnectionMode,
        addr: SocketAddr,
        codec: C,
        ctx: &Context<C::Object>,
    ) -> Result<Self> {
        let config = &ctx.config;
        let now = ctx.now();

        Ok(Self {
            id,
            mode,
            state: ConnectionState::Connecting,
            addr,
            mtu: config.packet_size,
            always_send_mtu: config.default_always_send_mtu,
            codec,
            send_window: SendWindow::new(config.packet_window, SEQUENCE_BITS)?,
            send_time: now,
            window_full_since: None,
            recv_time: now,
            recv_sequence: SEQUENCE_MASK,
            recv_history: 0,
            recv_since_last_send: 0,
            connect_deadline: None,
            connect_attempts: 0,
            network_rtt: config.default_network_ping,
            aliased_rtt: config.default_aliased_ping,
            remote_time_offset: 0,
            stats: LinkStats::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Peer {
        Peer {
            id: self.id,
            addr: self.addr,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn network_ping(&self) -> f32 {
        self.network_rtt
    }

    pub fn aliased_ping(&self) -> f32 {
        self.aliased_rtt
    }

    /// 원격 시계 추정치. 서버 시계를 받는 클라이언트측에서만 의미가 있다.
    pub fn remote_time(&self, now: u32) -> u32 {
        now.wrapping_add(self.remote_time_offset)
    }

    pub fn window_fill_ratio(&self) -> f32 {
        self.send_window.fill_ratio()
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn snapshot(&self, now: u32) -> ConnectionSnapshot {
        ConnectionSnapshot {
            peer: self.peer(),
            mode: self.mode,
            state: self.state,
            mtu: self.mtu,
            network_ping: self.network_rtt,
            aliased_ping: self.aliased_rtt,
            remote_time: self.remote_time(now),
            window_fill_ratio: self.window_fill_ratio(),
            stats: self.stats.clone(),
        }
    }

    pub fn set_option(&mut self, option: ConnectionOption) {
        match option {
            ConnectionOption::AlwaysSendMtu(value) => self.always_send_mtu = value,
        }
    }

    /// 서버측 연결만 시계를 보낸다
    fn sends_clock(&self) -> bool {
        self.mode == ConnectionMode::Server
    }

    fn expects_clock(&self) -> bool {
        self.mode == ConnectionMode::Client
    }

    /// 클라이언트 핸드셰이크 타임아웃: 재시도하거나 포기한다
    pub(crate) fn process_connecting_timeouts(&mut self, ctx: &mut Context<C::Object>, now: u32) {
        if self.mode != ConnectionMode::Client {
            return;
        }

        let due = self.connect_deadline.map_or(true, |deadline| time_reached(now, deadline));
        if due && !self.send_connect_request(ctx) {
            info!("connect to {} failed after {} attempts", self.addr, self.connect_attempts);
            ctx.raise(Event::ConnectFailed(self.addr));
            self.change_state(ctx, ConnectionState::Destroy);
        }
    }

    pub(crate) fn process_connected_timeouts(&mut self, ctx: &mut Context<C::Object>, now: u32) {
        let timeout = ctx.config.connection_timeout_ms;

        if now.wrapping_sub(self.recv_time) > timeout {
            debug!("disconnecting {} due to timeout", self.addr);
            self.change_state(ctx, ConnectionState::Disconnected);
        }

        if let Some(since) = self.window_full_since {
            if self.is_connected() && now.wrapping_sub(since) > timeout {
                self.connection_error(ctx, ConnectionError::SendWindowFull);
            }
        }

        if self.is_connected()
            && (now.wrapping_sub(self.send_time) > ctx.config.ping_timeout_ms
                || self.recv_since_last_send >= ctx.config.recv_without_ack_limit)
        {
            self.send_command(ctx, CommandType::Ping);
        }
    }

    pub(crate) fn change_state(&mut self, ctx: &mut Context<C::Object>, new_state: ConnectionState) {
        if new_state == self.state {
            return;
        }

        let old_state = std::mem::replace(&mut self.state, new_state);
        match new_state {
            ConnectionState::Connected => self.on_state_connected(ctx, old_state),
            ConnectionState::Disconnected => self.on_state_disconnected(ctx, old_state),
            _ => {}
        }
    }

    fn on_state_connected(&mut self, ctx: &mut Context<C::Object>, old_state: ConnectionState) {
        if old_state != ConnectionState::Connecting {
            return;
        }

        info!("connected to {} ({:?})", self.addr, self.mode);
        if self.mode == ConnectionMode::Server {
            self.send_command(ctx, CommandType::Accepted);
        }
        ctx.raise(Event::Connected(self.peer()));
    }

    fn on_state_disconnected(&mut self, ctx: &mut Context<C::Object>, old_state: ConnectionState) {
        if old_state != ConnectionState::Connected {
            return;
        }

        // 대기 중인 객체는 전부 손실
        let peer = self.peer();
        while let Some(handle) = self.send_window.pop() {
            if let Some(object) = handle.object {
                self.stats.packet_lost();
                ctx.stats.packet_lost();
                ctx.raise(Event::ObjectLost { peer, object });
            }
        }
        self.window_full_since = None;

        info!("disconnected from {}", self.addr);
        ctx.raise(Event::Disconnected(peer));
    }

    /// 로컬 연결 종료: Disconnected 명령을 보낸 뒤 전이
    pub(crate) fn disconnect(&mut self, ctx: &mut Context<C::Object>) {
        if self.is_connected() {
            self.send_command(ctx, CommandType::Disconnected);
            self.change_state(ctx, ConnectionState::Disconnected);
        }
    }

    /// 연결 대기 취소. 핸드셰이크 중이었으면 true
    pub(crate) fn cancel_connect(&mut self, ctx: &mut Context<C::Object>) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }

        ctx.raise(Event::ConnectFailed(self.addr));
        self.change_state(ctx, ConnectionState::Destroy);
        true
    }

    pub(crate) fn on_packet(&mut self, ctx: &mut Context<C::Object>, stream: &mut BitStream) {
        let bytes = stream.length() >> 3;
        self.stats.packet_received(bytes);
        ctx.stats.packet_received(bytes);

        self.recv_time = ctx.now();

        if Header::peek_is_object(stream.data()) {
            self.on_object_received(ctx, stream);
        } else {
            self.on_command_received(ctx, stream);
        }
    }

    fn on_command_received(&mut self, ctx: &mut Context<C::Object>, stream: &mut BitStream) {
        if !self.parse_header(ctx, stream) {
            return;
        }

        let code = match stream.read_u8(COMMAND_BITS) {
            Ok(code) => code,
            Err(e) => {
                debug!("truncated command packet from {}: {}", self.addr, e);
                return;
            }
        };

        match CommandType::try_from(code) {
            Ok(CommandType::Connect) => self.on_command_connect(ctx),
            Ok(CommandType::Accepted) => self.on_command_accepted(ctx),
            Ok(CommandType::Refused) => self.on_command_refused(ctx),
            Ok(CommandType::Disconnected) => self.on_command_disconnected(ctx),
            Ok(CommandType::Ping) => self.ensure_client_is_connected(ctx),
            Err(_) => self.connection_error(ctx, ConnectionError::IncorrectCommand),
        }
    }

    fn on_object_received(&mut self, ctx: &mut Context<C::Object>, stream: &mut BitStream) {
        self.ensure_client_is_connected(ctx);

        if !self.is_connected() || !self.parse_header(ctx, stream) {
            return;
        }

        match self.codec.unpack(stream) {
            Ok(object) => ctx.raise(Event::ObjectReceived {
                peer: self.peer(),
                object,
            }),
            Err(e) => debug!("failed to unpack object from {}: {}", self.addr, e),
        }
    }

    fn on_command_connect(&mut self, ctx: &mut Context<C::Object>) {
        match self.mode {
            // 클라이언트가 Accepted를 못 받아 재시도한 경우
            ConnectionMode::Server => {
                if self.is_connected() {
                    self.send_command(ctx, CommandType::Accepted);
                }
            }
            ConnectionMode::Client => self.connection_error(ctx, ConnectionError::IncorrectCommand),
        }
    }

    fn on_command_accepted(&mut self, ctx: &mut Context<C::Object>) {
        match self.mode {
            ConnectionMode::Client => {
                if self.state == ConnectionState::Connecting {
                    self.change_state(ctx, ConnectionState::Connected);
                }
            }
            ConnectionMode::Server => self.connection_error(ctx, ConnectionError::IncorrectCommand),
        }
    }

    fn on_command_refused(&mut self, ctx: &mut Context<C::Object>) {
        match self.mode {
            ConnectionMode::Client => {
                if self.state == ConnectionState::Connecting {
                    info!("connection to {} refused", self.addr);
                    ctx.raise(Event::ConnectRefused(self.addr));
                    self.change_state(ctx, ConnectionState::Destroy);
                }
            }
            ConnectionMode::Server => self.connection_error(ctx, ConnectionError::IncorrectCommand),
        }
    }

    fn on_command_disconnected(&mut self, ctx: &mut Context<C::Object>) {
        self.ensure_client_is_connected(ctx);

        if self.is_connected() {
            self.change_state(ctx, ConnectionState::Disconnected);
        }
    }

    /// Accepted 명령이 유실됐어도 서버 패킷이 오면 연결된 것으로 본다
    fn ensure_client_is_connected(&mut self, ctx: &mut Context<C::Object>) {
        if self.mode == ConnectionMode::Client
            && self.state == ConnectionState::Connecting
            && ctx.config.allow_implicit_accept
        {
            self.change_state(ctx, ConnectionState::Connected);
        }
    }

    fn connection_error(&mut self, ctx: &mut Context<C::Object>, error: ConnectionError) {
        error!("error {:?} on connection to {}", error, self.addr);
        self.change_state(ctx, ConnectionState::Disconnected);
    }

    fn send_connect_request(&mut self, ctx: &mut Context<C::Object>) -> bool {
        if self.connect_attempts >= ctx.config.connect_request_attempts {
            return false;
        }

        if self.connect_attempts != 0 {
            info!("retrying connection to {}", self.addr);
        }

        self.send_command(ctx, CommandType::Connect);
        self.connect_deadline = Some(ctx.now().wrapping_add(ctx.config.connect_request_timeout_ms));
        self.connect_attempts += 1;
        true
    }

    fn check_can_send(&mut self, ctx: &Context<C::Object>, sending_command: bool) -> std::result::Result<(), SendFailReason> {
        let full = self.send_window.is_full();
        if self.is_connected() && !full {
            return Ok(());
        }

        if sending_command && self.mode == ConnectionMode::Client && self.state == ConnectionState::Connecting {
            return Ok(());
        }

        if full && self.is_connected() {
            self.window_full_since.get_or_insert(ctx.now());
            return Err(SendFailReason::PacketWindowFull);
        }

        Err(SendFailReason::NotConnected)
    }

    /// 객체 전송. 결과는 ObjectSent 또는 ObjectSendFailed 이벤트 하나로 보고된다.
    pub(crate) fn send_object(&mut self, ctx: &mut Context<C::Object>, object: C::Object) {
        let peer = self.peer();
        let fail = |ctx: &Context<C::Object>, object: C::Object, reason: SendFailReason| {
            ctx.raise(Event::ObjectSendFailed { peer, object, reason });
        };

        if let Err(reason) = self.check_can_send(ctx, false) {
            fail(ctx, object, reason);
            return;
        }

        let header_bits = ctx.layout.bit_size(self.sends_clock());
        let stream = ctx.write_stream(self.mtu << 3, header_bits);
        let packed = self.codec.pack(stream, &object);
        let overflow = stream
            .is_overflowing()
            .then(|| (stream.position(), stream.length()));

        if let Err(e) = packed {
            debug!("failed to pack object for {}: {}", self.addr, e);
            fail(ctx, object, SendFailReason::SerializerFailed);
            return;
        }

        if let Some((position, length)) = overflow {
            if !ctx.config.allow_packet_overflow {
                error!(
                    "stream to {} is overflowing ({} of {} bits), not sending",
                    self.addr, position, length
                );
                fail(ctx, object, SendFailReason::StreamOverflow);
                return;
            }
        }

        let now = ctx.now();
        let header = self.make_header(ctx, true, now);
        header.pack(&mut ctx.write_stream, &ctx.layout);

        let handle = Handle {
            sequence: header.object_sequence,
            send_time: now,
            object: Some(object.clone()),
        };

        let expand = self.always_send_mtu;
        match self.send_stream(ctx, handle, expand) {
            Ok(bytes) => {
                self.stats.packet_sent(bytes);
                ctx.stats.packet_sent(bytes);
                ctx.raise(Event::ObjectSent { peer, object });
            }
            Err(reason) => fail(ctx, object, reason),
        }
    }

    pub(crate) fn send_command(&mut self, ctx: &mut Context<C::Object>, command: CommandType) -> bool {
        if self.check_can_send(ctx, true).is_err() {
            return false;
        }

        // 핸드셰이크 중인 클라이언트 윈도우에는 오래된 Connect 명령만 있다
        if self.send_window.is_full() {
            self.send_window.pop();
        }

        let header_bits = ctx.layout.bit_size(self.sends_clock());
        let stream = ctx.write_stream(self.mtu << 3, header_bits);
        stream.write_u8(command as u8, COMMAND_BITS);

        let now = ctx.now();
        let header = self.make_header(ctx, false, now);
        header.pack(&mut ctx.write_stream, &ctx.layout);

        let handle = Handle {
            sequence: header.object_sequence,
            send_time: now,
            object: None,
        };

        match self.send_stream(ctx, handle, false) {
            Ok(bytes) => {
                self.stats.packet_sent(bytes);
                ctx.stats.packet_sent(bytes);
                true
            }
            Err(_) => false,
        }
    }

    fn make_header(&self, ctx: &Context<C::Object>, is_object: bool, now: u32) -> Header {
        let ack_time = now.wrapping_sub(self.recv_time).min(ctx.config.max_ping_ms);

        Header {
            object_sequence: self.send_window.next_sequence(),
            ack_sequence: self.recv_sequence,
            ack_history: self.recv_history,
            ack_time: ack_time.min(u16::MAX as u32) as u16,
            is_object,
            clock: self.sends_clock().then_some(now),
        }
    }

    /// 핸들을 윈도우에 기록한 뒤 전송. 전송이 실패해도 핸들은 ack/손실 판정까지 남는다.
    fn send_stream(
        &mut self,
        ctx: &mut Context<C::Object>,
        handle: Handle<C::Object>,
        expand_to_mtu: bool,
    ) -> std::result::Result<usize, SendFailReason> {
        let mut bytes = bytes_required(ctx.write_stream.position());
        if expand_to_mtu && bytes < self.mtu {
            bytes = self.mtu;
        }

        self.send_time = handle.send_time;
        if self.send_window.enqueue(handle).is_err() {
            return Err(SendFailReason::PacketWindowFull);
        }
        self.send_window.next_for_packing();
        self.recv_since_last_send = 0;

        if ctx.send(self.addr, bytes) {
            Ok(bytes)
        } else {
            Err(SendFailReason::SocketError)
        }
    }

    /// 헤더 파싱 후 수신 기록과 ack 갱신. 새 패킷이면 true (커서는 헤더 직후)
    fn parse_header(&mut self, ctx: &mut Context<C::Object>, stream: &mut BitStream) -> bool {
        let header = match Header::unpack(stream, &ctx.layout, self.expects_clock()) {
            Ok(header) => header,
            Err(e) => {
                debug!("malformed header from {}: {}", self.addr, e);
                return false;
            }
        };

        let distance = sequence::distance(header.object_sequence, self.recv_sequence, SEQUENCE_BITS);
        let window = ctx.config.packet_window as i32;

        if distance > window || distance < -window {
            debug!(
                "sequence {} out of bounds (last {}, distance {})",
                header.object_sequence, self.recv_sequence, distance
            );
            self.connection_error(ctx, ConnectionError::SequenceOutOfBounds);
            return false;
        }

        // 오래됐거나 중복
        if distance <= 0 {
            return false;
        }

        self.recv_history = if distance as u32 >= ctx.config.ack_redundancy {
            1
        } else {
            (self.recv_history << distance) | 1
        };
        self.recv_sequence = header.object_sequence;
        self.recv_since_last_send += 1;

        self.ack_handles(ctx, &header);
        true
    }

    /// ack 범위에 들어온 핸들을 꼬리부터 전달/손실로 판정해 제거
    fn ack_handles(&mut self, ctx: &mut Context<C::Object>, header: &Header) {
        let peer = self.peer();
        let redundancy = ctx.config.ack_redundancy as i32;

        while let Some(tail) = self.send_window.peek() {
            let distance = sequence::distance(tail.sequence, header.ack_sequence, SEQUENCE_BITS);
            if distance > 0 {
                break;
            }

            let sequence = tail.sequence;
            let send_time = tail.send_time;
            let delivered = distance > -redundancy && header.ack_history & (1u64 << -distance) != 0;

            let handle = if delivered {
                self.send_window.mark_delivered(sequence);
                self.send_window.remove_delivered()
            } else {
                self.send_window.pop()
            };

            let Some(handle) = handle else {
                break;
            };

            if let Some(object) = handle.object {
                if delivered {
                    self.stats.packet_delivered();
                    ctx.stats.packet_delivered();
                    ctx.raise(Event::ObjectDelivered { peer, object });
                } else {
                    self.stats.packet_lost();
                    ctx.stats.packet_lost();
                    ctx.raise(Event::ObjectLost { peer, object });
                }
            }

            if distance == 0 {
                self.update_ping(ctx, header.clock, send_time, header.ack_time);
            }
        }

        if !self.send_window.is_full() {
            self.window_full_since = None;
        }
    }

    /// ack 하나로 RTT와 원격 시계 오프셋 갱신
    ///
    /// 왕복 힌트가 꺼져 있으면 네트워크 RTT는 그대로 두고 오프셋은 aliased RTT로 계산한다.
    fn update_ping(&mut self, ctx: &Context<C::Object>, remote_clock: Option<u32>, send_time: u32, ack_time: u16) {
        let aliased = self.recv_time.wrapping_sub(send_time);
        self.aliased_rtt = self.aliased_rtt * 0.9 + (aliased as f32 / 1000.0) * 0.1;

        let has_hint = ctx.layout.round_trip_hint;
        if has_hint {
            let network = aliased - (ack_time as u32).min(aliased);
            self.network_rtt = self.network_rtt * 0.9 + (network as f32 / 1000.0) * 0.1;
        }

        if let Some(remote) = remote_clock {
            let rtt = match ctx.config.authoritative_rtt {
                RttSource::Network if has_hint => self.network_rtt,
                _ => self.aliased_rtt,
            };
            self.remote_time_offset = remote
                .wrapping_sub(self.recv_time)
                .wrapping_add((rtt * 500.0) as u32);
        }
    }
}
