//! 링크 통계

use std::time::{Duration, Instant};

/// 연결별 (또는 소켓 전체) 패킷 통계
#[derive(Debug, Clone)]
pub struct LinkStats {
    /// 집계 시작 시간
    pub start_time: Instant,

    /// 송신 패킷 수
    pub packets_sent: u64,

    /// 송신 바이트
    pub bytes_sent: u64,

    /// 수신 패킷 수
    pub packets_received: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// ack로 전달이 확인된 객체 수
    pub packets_delivered: u64,

    /// 손실 판정된 객체 수
    pub packets_lost: u64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_sent: 0,
            bytes_sent: 0,
            packets_received: 0,
            bytes_received: 0,
            packets_delivered: 0,
            packets_lost: 0,
        }
    }

    /// 송신 기록
    pub fn packet_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// 수신 기록
    pub fn packet_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn packet_delivered(&mut self) {
        self.packets_delivered += 1;
    }

    pub fn packet_lost(&mut self) {
        self.packets_lost += 1;
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 손실률 (판정이 끝난 객체 기준)
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_delivered + self.packets_lost;
        if total == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / total as f64
    }

    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / elapsed
    }

    /// 통계 리셋
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} pkts / {} bytes | Recv: {} pkts / {} bytes | Delivered: {} | Lost: {} ({:.2}%)",
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.packets_delivered,
            self.packets_lost,
            self.loss_rate() * 100.0,
        )
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_rate() {
        let mut stats = LinkStats::new();
        assert_eq!(stats.loss_rate(), 0.0);

        for _ in 0..3 {
            stats.packet_delivered();
        }
        stats.packet_lost();
        assert!((stats.loss_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters_and_reset() {
        let mut stats = LinkStats::new();
        stats.packet_sent(100);
        stats.packet_sent(20);
        stats.packet_received(64);

        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 120);
        assert_eq!(stats.bytes_received, 64);
        assert!(stats.summary().contains("Sent: 2 pkts"));

        stats.reset();
        assert_eq!(stats.packets_sent, 0);
    }
}
