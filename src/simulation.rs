//! 손실/지연 시뮬레이션 (디버그용)
//!
//! 수신 경로에서 패킷을 확률적으로 버리거나, 균등 분포 지연 후 다시 넣는다.
//! 설정에 노이즈 함수가 있으면 내부 난수 대신 그 값을 쓴다.

use std::collections::VecDeque;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::NoiseFn;
use crate::context::time_reached;
use crate::stream::BufferPool;
use crate::Config;

/// 지연 중인 패킷
#[derive(Debug)]
pub struct DelayedPacket {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
    pub len: usize,
    /// 전달 시각 (ms)
    pub time: u32,
}

/// 패킷 시뮬레이터
#[derive(Debug)]
pub struct Simulator {
    rng: StdRng,
    loss: f32,
    ping_min_ms: u32,
    ping_max_ms: u32,
    noise: Option<NoiseFn>,
    delayed: VecDeque<DelayedPacket>,
    pool: BufferPool,
}

impl Simulator {
    pub fn new(config: &Config) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// 재현 가능한 시드로 생성
    pub fn with_seed(config: &Config, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &Config, rng: StdRng) -> Self {
        Self {
            rng,
            loss: config.simulated_loss,
            ping_min_ms: config.simulated_ping_min_ms,
            ping_max_ms: config.simulated_ping_max_ms,
            noise: config.simulated_noise.clone(),
            delayed: VecDeque::new(),
            pool: BufferPool::new(config.recv_buffer_size()),
        }
    }

    /// 0.0 ~ 1.0 난수
    fn sample(&mut self) -> f32 {
        match &self.noise {
            Some(noise) => noise.sample(),
            None => self.rng.gen::<f32>(),
        }
    }

    /// 이번 패킷을 버릴지
    pub fn should_drop(&mut self) -> bool {
        if self.loss > 0.0 && self.sample() < self.loss {
            debug!("dropping packet (simulated)");
            return true;
        }
        false
    }

    pub fn delays(&self) -> bool {
        self.ping_min_ms > 0 && self.ping_max_ms > 0 && self.ping_min_ms < self.ping_max_ms
    }

    /// 지연 큐에 복사해 넣는다. 지연이 꺼져 있으면 false
    pub fn delay(&mut self, addr: SocketAddr, data: &[u8], now: u32) -> bool {
        if !self.delays() {
            return false;
        }

        let mut buffer = self.pool.acquire();
        if buffer.len() < data.len() {
            buffer.resize(data.len(), 0);
        }
        buffer[..data.len()].copy_from_slice(data);

        let span = self.ping_max_ms - self.ping_min_ms;
        let latency = if self.noise.is_some() {
            self.ping_min_ms + ((span as f32 * self.sample()) as u32).min(span - 1)
        } else {
            self.rng.gen_range(self.ping_min_ms..self.ping_max_ms)
        };
        self.delayed.push_back(DelayedPacket {
            addr,
            data: buffer,
            len: data.len(),
            time: now.wrapping_add(latency),
        });
        true
    }

    /// 전달 시각이 지난 가장 오래된 패킷 (도착 순서 유지)
    pub fn pop_due(&mut self, now: u32) -> Option<DelayedPacket> {
        match self.delayed.front() {
            Some(packet) if time_reached(now, packet.time) => self.delayed.pop_front(),
            _ => None,
        }
    }

    /// 버퍼를 풀에 반환
    pub fn recycle(&self, packet: DelayedPacket) {
        self.pool.release(packet.data);
    }

    pub fn pending(&self) -> usize {
        self.delayed.len()
    }

    pub fn clear(&mut self) {
        self.delayed.clear();
        self.pool.clear();
    }
}
