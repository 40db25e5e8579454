//! 비트 단위 읽기/쓰기 스트림
//!
//! - LSB 우선: 한 바이트 안에서 낮은 비트부터 채운다
//! - 헤더는 비트 0부터, 페이로드는 헤더 크기 위치부터 기록
//! - `length`를 넘어선 쓰기는 버퍼를 늘리고 overflow로 표시

use parking_lot::Mutex;

use crate::{Error, Result};

/// 바이트 수 계산 (비트 -> 바이트, 올림)
#[inline]
pub fn bytes_required(bits: usize) -> usize {
    (bits + 7) >> 3
}

/// 비트 스트림
#[derive(Debug, Clone, Default)]
pub struct BitStream {
    data: Vec<u8>,
    /// 현재 커서 (비트)
    position: usize,
    /// 유효 길이 (비트)
    length: usize,
}

impl BitStream {
    /// `length_bits` 크기의 쓰기용 스트림
    pub fn with_length(length_bits: usize) -> Self {
        Self {
            data: vec![0u8; bytes_required(length_bits)],
            position: 0,
            length: length_bits,
        }
    }

    /// 수신 데이터로 읽기용 스트림 생성
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            position: 0,
            length: bytes.len() << 3,
        }
    }

    /// 쓰기 준비: 버퍼를 비우고 길이와 시작 위치 설정
    pub fn reset_for_write(&mut self, length_bits: usize, offset_bits: usize) {
        self.data.clear();
        self.data.resize(bytes_required(length_bits.max(offset_bits)), 0);
        self.length = length_bits;
        self.position = offset_bits;
    }

    /// 읽기 준비: `raw_mut()`로 채운 앞쪽 `len` 바이트를 유효 데이터로 설정
    pub fn reset_for_read(&mut self, len: usize) {
        self.data.truncate(len);
        self.position = 0;
        self.length = len << 3;
    }

    /// 수신용 원시 버퍼 (0으로 초기화 후 `capacity` 바이트 확보)
    pub fn raw_mut(&mut self, capacity: usize) -> &mut [u8] {
        self.data.clear();
        self.data.resize(capacity, 0);
        &mut self.data
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// 읽을 수 있는 남은 비트
    pub fn remaining(&self) -> usize {
        self.length.saturating_sub(self.position)
    }

    /// 커서가 유효 길이를 넘었는지
    pub fn is_overflowing(&self) -> bool {
        self.position > self.length
    }

    pub fn can_read(&self, bits: usize) -> bool {
        self.position + bits <= self.length
    }

    /// 전체 버퍼
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 커서까지 기록된 바이트
    pub fn written(&self) -> &[u8] {
        let len = bytes_required(self.position).min(self.data.len());
        &self.data[..len]
    }

    /// 최대 64비트 기록
    pub fn write_bits(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 64);
        let end = self.position + bits as usize;
        let needed = bytes_required(end);
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }

        let mut value = if bits == 64 { value } else { value & ((1u64 << bits) - 1) };
        let mut left = bits as usize;
        while left > 0 {
            let index = self.position >> 3;
            let offset = self.position & 7;
            let take = (8 - offset).min(left);
            let chunk_mask = ((1u16 << take) - 1) as u8;

            self.data[index] &= !(chunk_mask << offset);
            self.data[index] |= ((value as u8) & chunk_mask) << offset;

            value >>= take;
            left -= take;
            self.position += take;
        }
    }

    /// 최대 64비트 읽기
    pub fn read_bits(&mut self, bits: u32) -> Result<u64> {
        debug_assert!(bits <= 64);
        if !self.can_read(bits as usize) {
            return Err(Error::StreamUnderflow {
                needed: bits as usize,
                available: self.remaining(),
            });
        }

        let mut result = 0u64;
        let mut shift = 0usize;
        let mut left = bits as usize;
        while left > 0 {
            let index = self.position >> 3;
            let offset = self.position & 7;
            let take = (8 - offset).min(left);
            let chunk_mask = ((1u16 << take) - 1) as u8;
            let byte = self.data.get(index).copied().unwrap_or(0);

            result |= (((byte >> offset) & chunk_mask) as u64) << shift;

            shift += take;
            left -= take;
            self.position += take;
        }
        Ok(result)
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_bits(value as u64, 1);
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn write_u8(&mut self, value: u8, bits: u32) {
        self.write_bits(value as u64, bits.min(8));
    }

    pub fn read_u8(&mut self, bits: u32) -> Result<u8> {
        Ok(self.read_bits(bits.min(8))? as u8)
    }

    pub fn write_u16(&mut self, value: u16, bits: u32) {
        self.write_bits(value as u64, bits.min(16));
    }

    pub fn read_u16(&mut self, bits: u32) -> Result<u16> {
        Ok(self.read_bits(bits.min(16))? as u16)
    }

    pub fn write_u32(&mut self, value: u32, bits: u32) {
        self.write_bits(value as u64, bits.min(32));
    }

    pub fn read_u32(&mut self, bits: u32) -> Result<u32> {
        Ok(self.read_bits(bits.min(32))? as u32)
    }

    pub fn write_u64(&mut self, value: u64, bits: u32) {
        self.write_bits(value, bits.min(64));
    }

    pub fn read_u64(&mut self, bits: u32) -> Result<u64> {
        self.read_bits(bits.min(64))
    }

    /// 바이트 배열 기록 (정렬되어 있으면 통째로 복사)
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.position & 7 == 0 {
            let start = self.position >> 3;
            let end = start + bytes.len();
            if self.data.len() < end {
                self.data.resize(end, 0);
            }
            self.data[start..end].copy_from_slice(bytes);
            self.position += bytes.len() << 3;
        } else {
            for &b in bytes {
                self.write_bits(b as u64, 8);
            }
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if !self.can_read(len << 3) {
            return Err(Error::StreamUnderflow {
                needed: len << 3,
                available: self.remaining(),
            });
        }

        if self.position & 7 == 0 {
            let start = self.position >> 3;
            self.position += len << 3;
            Ok(self.data[start..start + len].to_vec())
        } else {
            (0..len).map(|_| self.read_u8(8)).collect()
        }
    }
}

/// 바이트 버퍼 풀 (mutex 보호 스택)
///
/// 네트워크 스레드의 한 패킷 처리보다 오래 살아야 하는 데이터에 사용
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
        }
    }

    /// 버퍼 획득 (비어 있으면 새로 할당), 내용은 0으로 초기화됨
    pub fn acquire(&self) -> Vec<u8> {
        let mut buffer = self.buffers.lock().pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(self.buffer_size, 0);
        buffer
    }

    /// 버퍼 반환
    pub fn release(&self, buffer: Vec<u8>) {
        self.buffers.lock().push(buffer);
    }

    /// 풀에 보관 중인 버퍼 수
    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn clear(&self) {
        self.buffers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_fields() {
        let mut stream = BitStream::with_length(128);
        stream.write_bool(true);
        stream.write_u16(0x1234, 15);
        stream.write_u64(0xDEAD_BEEF_0BAD_F00D, 64);
        stream.write_u8(0x5, 3);

        let mut reader = BitStream::from_bytes(stream.written());
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u16(15).unwrap(), 0x1234);
        assert_eq!(reader.read_u64(64).unwrap(), 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(reader.read_u8(3).unwrap(), 0x5);
    }

    #[test]
    fn test_lsb_first_layout() {
        let mut stream = BitStream::with_length(16);
        stream.write_u16((7 << 1) | 1, 16);
        assert_eq!(stream.data()[0], 0x0F);
        assert_eq!(stream.data()[0] & 1, 1);
    }

    #[test]
    fn test_overflow_and_underflow() {
        let mut stream = BitStream::with_length(8);
        stream.write_bytes(&[1, 2]);
        assert!(stream.is_overflowing());
        assert_eq!(stream.written(), &[1, 2]);

        let mut reader = BitStream::from_bytes(&[0xFF]);
        assert!(reader.read_u16(16).is_err());
        assert_eq!(reader.read_u8(8).unwrap(), 0xFF);
    }

    #[test]
    fn test_reset_for_write_clears() {
        let mut stream = BitStream::with_length(32);
        stream.write_u32(u32::MAX, 32);
        stream.reset_for_write(32, 8);
        assert_eq!(stream.position(), 8);
        assert!(stream.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(64);
        let mut buffer = pool.acquire();
        buffer[0] = 9;
        pool.release(buffer);
        assert_eq!(pool.pooled(), 1);

        let buffer = pool.acquire();
        assert_eq!(buffer.len(), 64);
        assert_eq!(buffer[0], 0);
        assert_eq!(pool.pooled(), 0);
    }
}
