//! 시퀀스 번호 연산
//!
//! 고정 비트폭 시퀀스의 wraparound 안전 비교. 두 값을 네이티브 정수 상단으로
//! 밀어 올린 뒤 빼고 다시 산술 시프트로 내리면 부호가 실제 선후 관계를 나타낸다.
//! 실제 간격이 시퀀스 공간의 절반 미만일 때만 의미가 있다.

use crate::{Error, Result};

/// 연결이 사용하는 시퀀스 비트 수 (와이어에서는 16비트 필드의 상위 15비트)
pub const SEQUENCE_BITS: u32 = 15;

/// 연결 시퀀스 마스크
pub const SEQUENCE_MASK: u32 = (1 << SEQUENCE_BITS) - 1;

/// 시퀀스 비트 수 검증
pub fn check_bits(bits: u32) -> Result<()> {
    if !(4..=32).contains(&bits) {
        return Err(Error::InvalidSequenceBits { bits });
    }
    Ok(())
}

/// `bits` 폭의 시퀀스 마스크
#[inline]
pub fn mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// `from - to`를 `[-2^(bits-1), 2^(bits-1))` 범위의 부호 있는 값으로 반환
#[inline]
pub fn distance(from: u32, to: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((from << shift).wrapping_sub(to << shift) as i32) >> shift
}

/// 다음 시퀀스
#[inline]
pub fn next(sequence: u32, bits: u32) -> u32 {
    sequence.wrapping_add(1) & mask(bits)
}

/// 순차 시퀀스 생성기
#[derive(Debug, Clone)]
pub struct SequenceGenerator {
    mask: u32,
    sequence: u32,
}

impl SequenceGenerator {
    /// `start` 다음 값부터 생성
    pub fn new(bits: u32, start: u32) -> Self {
        let mask = mask(bits);
        Self {
            mask,
            sequence: start & mask,
        }
    }

    pub fn next(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1) & self.mask;
        self.sequence
    }

    /// 마지막으로 생성한 시퀀스
    pub fn current(&self) -> u32 {
        self.sequence
    }
}

/// 시퀀스를 가진 값 (윈도우 엔트리)
pub trait Sequenced {
    fn sequence(&self) -> u32;
    fn set_sequence(&mut self, sequence: u32);
}
