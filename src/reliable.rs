//! 신뢰 채널 버퍼
//!
//! 객체 전송 위에서 순서 보장 + 재전송 채널을 직접 구성할 때 쓰는 송신/수신 윈도우 쌍.
//! 시퀀스 폭은 윈도우 크기에서 유도한다 (log2(window) + 2 비트).

use crate::recv_window::{RecvOutcome, RecvWindow};
use crate::send_window::{check_capacity, SendWindow, SlotState};
use crate::sequence::Sequenced;
use crate::stream::BitStream;
use crate::Result;

/// 송신/수신 윈도우 쌍
#[derive(Debug)]
pub struct ReliableBuffer<T> {
    send: SendWindow<T>,
    recv: RecvWindow<T>,
    sequence_bits: u32,
}

impl<T: Sequenced> ReliableBuffer<T> {
    pub fn new(window: usize) -> Result<Self> {
        let sequence_bits = window.trailing_zeros() + 2;
        check_capacity(window, sequence_bits)?;

        Ok(Self {
            send: SendWindow::new(window, sequence_bits)?,
            recv: RecvWindow::new(window, sequence_bits)?,
            sequence_bits,
        })
    }

    /// 와이어에 쓰는 시퀀스 폭
    pub fn sequence_bits(&self) -> u32 {
        self.sequence_bits
    }

    /// 시퀀스를 스트림에 기록
    pub fn write_sequence(&self, stream: &mut BitStream, value: &T) {
        stream.write_u32(value.sequence(), self.sequence_bits);
    }

    /// 스트림에서 시퀀스 읽기
    pub fn read_sequence(&self, stream: &mut BitStream) -> Result<u32> {
        stream.read_u32(self.sequence_bits)
    }

    /// 송신 대기열에 추가. 가득 차면 값을 돌려준다.
    pub fn send_enqueue(&mut self, value: T) -> std::result::Result<(), T> {
        self.send.enqueue(value)
    }

    pub fn send_next_for_packing(&mut self) -> Option<&T> {
        self.send.next_for_packing()
    }

    pub fn send_remove_delivered(&mut self) -> Option<T> {
        self.send.remove_delivered()
    }

    pub fn send_mark_delivered(&mut self, sequence: u32) -> bool {
        self.send.mark_delivered(sequence)
    }

    /// 손실된 패킷에 실린 엔트리를 재전송 대상으로 되돌린다
    pub fn send_mark_send_again(&mut self, sequence: u32) -> bool {
        self.send.mark_send_again(sequence)
    }

    pub fn send_state(&self, sequence: u32) -> Option<SlotState> {
        self.send.state_of(sequence)
    }

    pub fn send_is_full(&self) -> bool {
        self.send.is_full()
    }

    pub fn send_len(&self) -> usize {
        self.send.len()
    }

    pub fn recv_enqueue(&mut self, value: T) -> RecvOutcome {
        self.recv.try_enqueue(value)
    }

    pub fn recv_deliver(&mut self) -> Option<T> {
        self.recv.try_deliver()
    }
}
