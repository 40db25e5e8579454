//! 수신 윈도우
//!
//! 순서가 뒤섞여 도착한 객체를 재정렬해 엄격히 순차적으로 내보낸다.
//! `tail`에서 `i`번째 슬롯은 `expected_next + i` 시퀀스의 객체를 담는다.

use crate::send_window::check_capacity;
use crate::sequence::{self, Sequenced};
use crate::Result;

/// 수신 윈도우 추가 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// 슬롯에 추가됨
    Added,

    /// 같은 시퀀스가 이미 대기 중 (중복)
    AlreadyExists,

    /// 이미 전달된 시퀀스 (재전송)
    Old,

    /// 윈도우 범위 밖 (프로토콜 위반)
    OutOfBounds,
}

/// 수신 윈도우
#[derive(Debug)]
pub struct RecvWindow<T> {
    slots: Vec<Option<T>>,
    tail: usize,
    mask: usize,
    sequence_bits: u32,
    expected_next: u32,
}

impl<T: Sequenced> RecvWindow<T> {
    /// 새 윈도우 생성. 첫 기대 시퀀스는 0
    pub fn new(capacity: usize, sequence_bits: u32) -> Result<Self> {
        check_capacity(capacity, sequence_bits)?;

        Ok(Self {
            slots: (0..capacity).map(|_| None).collect(),
            tail: 0,
            mask: capacity - 1,
            sequence_bits,
            expected_next: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 다음으로 전달될 시퀀스
    pub fn expected_next(&self) -> u32 {
        self.expected_next
    }

    /// 대기 중인 객체 수
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// 시퀀스 거리로 분류해 추가 시도
    pub fn try_enqueue(&mut self, value: T) -> RecvOutcome {
        let capacity = self.slots.len() as i32;
        let distance = sequence::distance(value.sequence(), self.expected_next, self.sequence_bits);

        if distance <= -capacity || distance >= capacity {
            return RecvOutcome::OutOfBounds;
        }

        if distance < 0 {
            return RecvOutcome::Old;
        }

        let index = (self.tail + distance as usize) & self.mask;
        if self.slots[index].is_some() {
            return RecvOutcome::AlreadyExists;
        }

        self.slots[index] = Some(value);
        RecvOutcome::Added
    }

    /// `tail` 슬롯이 채워졌을 때만 꺼낸다. 뒤쪽 슬롯이 차 있어도 순서를 건너뛰지 않는다.
    pub fn try_deliver(&mut self) -> Option<T> {
        let value = self.slots[self.tail].take()?;

        self.tail = (self.tail + 1) & self.mask;
        self.expected_next = sequence::next(value.sequence(), self.sequence_bits);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(u32);

    impl Sequenced for Item {
        fn sequence(&self) -> u32 {
            self.0
        }

        fn set_sequence(&mut self, sequence: u32) {
            self.0 = sequence;
        }
    }

    fn drain(window: &mut RecvWindow<Item>) -> Vec<u32> {
        std::iter::from_fn(|| window.try_deliver()).map(|item| item.0).collect()
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut window = RecvWindow::new(8, 16).unwrap();
        for seq in [3, 1, 4, 2] {
            assert_eq!(window.try_enqueue(Item(seq)), RecvOutcome::Added);
        }

        // 0이 비어 있으므로 아무것도 나가지 않음
        assert!(window.try_deliver().is_none());

        assert_eq!(window.try_enqueue(Item(0)), RecvOutcome::Added);
        assert_eq!(drain(&mut window), vec![0, 1, 2, 3, 4]);
        assert_eq!(window.expected_next(), 5);
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn test_duplicate_and_old() {
        let mut window = RecvWindow::new(8, 16).unwrap();
        assert_eq!(window.try_enqueue(Item(1)), RecvOutcome::Added);
        assert_eq!(window.try_enqueue(Item(1)), RecvOutcome::AlreadyExists);

        assert_eq!(window.try_enqueue(Item(0)), RecvOutcome::Added);
        assert_eq!(drain(&mut window), vec![0, 1]);

        assert_eq!(window.try_enqueue(Item(0)), RecvOutcome::Old);
        assert_eq!(window.try_enqueue(Item(1)), RecvOutcome::Old);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut window = RecvWindow::new(8, 16).unwrap();
        assert_eq!(window.try_enqueue(Item(8)), RecvOutcome::OutOfBounds);
        assert_eq!(window.try_enqueue(Item(65535 - 8)), RecvOutcome::OutOfBounds);
        assert_eq!(window.try_enqueue(Item(7)), RecvOutcome::Added);
    }

    #[test]
    fn test_delivery_across_wraparound() {
        let mut window = RecvWindow::new(4, 4).unwrap();
        let mut delivered = Vec::new();
        for seq in 0..20u32 {
            assert_eq!(window.try_enqueue(Item(seq & 0xF)), RecvOutcome::Added);
            delivered.extend(drain(&mut window));
        }
        let expected: Vec<u32> = (0..20u32).map(|s| s & 0xF).collect();
        assert_eq!(delivered, expected);
    }
}
