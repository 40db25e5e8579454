//! 송신 윈도우
//!
//! 고정 크기 링 버퍼. 각 슬롯은 Free -> Send -> Transit -> Delivered 상태를 거친다.
//! 점유 슬롯은 항상 `tail`부터 연속이며, 제거는 `tail`에서만 순서대로 일어난다.
//! 내부 잠금 없음 (네트워크 스레드 전용).

use crate::sequence::{self, SequenceGenerator, Sequenced};
use crate::{Error, Result};

/// 최소 윈도우 크기
pub const MIN_WINDOW: usize = 1 << 2;

/// 최대 윈도우 크기
pub const MAX_WINDOW: usize = 1 << 14;

/// 윈도우 크기 검증 (2의 거듭제곱, 4 ~ 16384, 시퀀스 공간 절반 이하)
pub fn check_capacity(capacity: usize, sequence_bits: u32) -> Result<()> {
    sequence::check_bits(sequence_bits)?;
    let half_space = 1u64 << (sequence_bits - 1);
    if !capacity.is_power_of_two()
        || !(MIN_WINDOW..=MAX_WINDOW).contains(&capacity)
        || capacity as u64 > half_space
    {
        return Err(Error::InvalidWindow { capacity });
    }
    Ok(())
}

/// 슬롯 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Free,
    Send,
    Transit,
    Delivered,
}

#[derive(Debug)]
struct Slot<T> {
    state: SlotState,
    value: Option<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            state: SlotState::Free,
            value: None,
        }
    }
}

/// 송신 윈도우
#[derive(Debug)]
pub struct SendWindow<T> {
    slots: Vec<Slot<T>>,
    tail: usize,
    count: usize,
    mask: usize,
    sequence_bits: u32,
    generator: SequenceGenerator,
}

impl<T: Sequenced> SendWindow<T> {
    /// 새 윈도우 생성. 첫 시퀀스는 0
    pub fn new(capacity: usize, sequence_bits: u32) -> Result<Self> {
        check_capacity(capacity, sequence_bits)?;

        Ok(Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            tail: 0,
            count: 0,
            mask: capacity - 1,
            sequence_bits,
            generator: SequenceGenerator::new(sequence_bits, u32::MAX),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    /// 점유율 (0.0 ~ 1.0)
    pub fn fill_ratio(&self) -> f32 {
        self.count as f32 / self.slots.len() as f32
    }

    /// 다음 `enqueue`가 부여할 시퀀스
    pub fn next_sequence(&self) -> u32 {
        sequence::next(self.generator.current(), self.sequence_bits)
    }

    /// 다음 시퀀스를 부여해 `Send` 상태로 추가. 가득 차면 값을 그대로 돌려준다.
    pub fn enqueue(&mut self, mut value: T) -> std::result::Result<(), T> {
        if self.is_full() {
            return Err(value);
        }

        let index = (self.tail + self.count) & self.mask;
        value.set_sequence(self.generator.next());
        self.slots[index] = Slot {
            state: SlotState::Send,
            value: Some(value),
        };

        self.count += 1;
        Ok(())
    }

    /// `tail`부터 첫 `Send` 엔트리를 찾아 `Transit`으로 바꾸고 반환 (제거하지 않음)
    pub fn next_for_packing(&mut self) -> Option<&T> {
        for i in 0..self.count {
            let index = (self.tail + i) & self.mask;
            if self.slots[index].state == SlotState::Send {
                self.slots[index].state = SlotState::Transit;
                return self.slots[index].value.as_ref();
            }
        }
        None
    }

    /// `tail`이 `Delivered`일 때만 꺼낸다
    pub fn remove_delivered(&mut self) -> Option<T> {
        if self.count > 0 && self.slots[self.tail].state == SlotState::Delivered {
            return self.pop();
        }
        None
    }

    /// 상태와 무관하게 `tail` 엔트리를 꺼낸다 (손실 판정, 연결 종료 시 비우기)
    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }

        let slot = std::mem::take(&mut self.slots[self.tail]);
        self.tail = (self.tail + 1) & self.mask;
        self.count -= 1;
        slot.value
    }

    /// `tail` 엔트리 참조
    pub fn peek(&self) -> Option<&T> {
        if self.count == 0 {
            return None;
        }
        self.slots[self.tail].value.as_ref()
    }

    /// 시퀀스 엔트리의 상태
    pub fn state_of(&self, sequence: u32) -> Option<SlotState> {
        self.index_of(sequence).map(|index| self.slots[index].state)
    }

    pub fn mark_delivered(&mut self, sequence: u32) -> bool {
        self.change_state(sequence, SlotState::Delivered)
    }

    /// 재전송 대상으로 되돌린다
    pub fn mark_send_again(&mut self, sequence: u32) -> bool {
        self.change_state(sequence, SlotState::Send)
    }

    fn change_state(&mut self, sequence: u32, state: SlotState) -> bool {
        match self.index_of(sequence) {
            Some(index) => {
                self.slots[index].state = state;
                true
            }
            None => false,
        }
    }

    /// `tail` 기준 거리로 슬롯 위치 계산. `[0, count)` 밖이면 None
    fn index_of(&self, sequence: u32) -> Option<usize> {
        let tail_sequence = self.peek()?.sequence();
        let distance = sequence::distance(sequence, tail_sequence, self.sequence_bits);
        if distance < 0 || distance as usize >= self.count {
            return None;
        }
        Some((self.tail + distance as usize) & self.mask)
    }
}
