//! 패킷 헤더 정의
//!
//! 모든 데이터그램은 비트 단위로 패킹된 헤더로 시작한다.
//!
//! ```text
//!  bit 0                16               32                32+R        48+R      80+R
//!  ├─ obj seq<<1|obj ──┼─ ack seq<<1 ───┼─ ack history (R) ─┼─ rtt hint ─┼─ clock ─┤
//! ```
//!
//! - obj seq 필드의 최하위 비트(첫 바이트의 비트 0)는 객체 패킷 여부
//! - rtt hint는 설정으로 끌 수 있음
//! - clock은 서버측 연결이 보내는 패킷에만 존재

use crate::sequence::{SEQUENCE_BITS, SEQUENCE_MASK};
use crate::stream::BitStream;
use crate::{Config, Error, Result};

/// 시퀀스 필드 폭 (비트)
pub const SEQUENCE_FIELD_BITS: u32 = SEQUENCE_BITS + 1;

/// 왕복 힌트 폭 (비트)
pub const ROUND_TRIP_HINT_BITS: u32 = 16;

/// 송신측 시계 폭 (비트)
pub const CLOCK_BITS: u32 = 32;

/// 명령 코드 폭 (비트)
pub const COMMAND_BITS: u32 = 8;

/// 프로토콜 명령 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    /// 연결 요청
    Connect = 1,

    /// 연결 수락
    Accepted = 2,

    /// 연결 거절
    Refused = 3,

    /// 연결 종료
    Disconnected = 4,

    /// 생존 확인 겸 ack 전달
    Ping = 5,
}

impl TryFrom<u8> for CommandType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CommandType::Connect),
            2 => Ok(CommandType::Accepted),
            3 => Ok(CommandType::Refused),
            4 => Ok(CommandType::Disconnected),
            5 => Ok(CommandType::Ping),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// 헤더 레이아웃 (설정에서 유도)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    /// ack history 비트 수
    pub ack_redundancy: u32,

    /// 왕복 힌트 포함 여부
    pub round_trip_hint: bool,
}

impl HeaderLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ack_redundancy: config.ack_redundancy,
            round_trip_hint: config.round_trip_hint,
        }
    }

    /// 헤더 크기 (비트)
    pub fn bit_size(&self, with_clock: bool) -> usize {
        let mut bits = 2 * SEQUENCE_FIELD_BITS + self.ack_redundancy;
        if self.round_trip_hint {
            bits += ROUND_TRIP_HINT_BITS;
        }
        if with_clock {
            bits += CLOCK_BITS;
        }
        bits as usize
    }
}

/// 패킷 헤더
///
/// 패킹/언패킹마다 새로 만드는 불변 값
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// 이 패킷의 시퀀스
    pub object_sequence: u32,

    /// 마지막으로 받은 상대 시퀀스
    pub ack_sequence: u32,

    /// ack_sequence 기준 최근 수신 비트맵 (비트 0 = ack_sequence)
    pub ack_history: u64,

    /// 마지막 수신 후 이 패킷을 보낼 때까지의 지연 (ms)
    pub ack_time: u16,

    /// 객체 패킷 여부 (false면 명령 패킷)
    pub is_object: bool,

    /// 송신측 시계 (ms)
    pub clock: Option<u32>,
}

impl Header {
    /// 첫 바이트만 보고 객체 패킷인지 판별
    #[inline]
    pub fn peek_is_object(datagram: &[u8]) -> bool {
        datagram.first().map(|b| b & 1 == 1).unwrap_or(false)
    }

    /// 스트림 앞부분(비트 0)에 헤더 기록. 커서 위치는 유지된다.
    pub fn pack(&self, stream: &mut BitStream, layout: &HeaderLayout) {
        let position = stream.position();
        stream.set_position(0);

        let object_field = ((self.object_sequence & SEQUENCE_MASK) << 1) | self.is_object as u32;
        let ack_field = (self.ack_sequence & SEQUENCE_MASK) << 1;

        stream.write_u32(object_field, SEQUENCE_FIELD_BITS);
        stream.write_u32(ack_field, SEQUENCE_FIELD_BITS);
        stream.write_u64(self.ack_history, layout.ack_redundancy);

        if layout.round_trip_hint {
            stream.write_u16(self.ack_time, ROUND_TRIP_HINT_BITS);
        }

        if let Some(clock) = self.clock {
            stream.write_u32(clock, CLOCK_BITS);
        }

        stream.set_position(position);
    }

    /// 스트림 비트 0부터 헤더 읽기. 커서는 헤더 직후에 위치한다.
    pub fn unpack(stream: &mut BitStream, layout: &HeaderLayout, with_clock: bool) -> Result<Self> {
        stream.set_position(0);

        let object_field = stream.read_u32(SEQUENCE_FIELD_BITS)?;
        let ack_field = stream.read_u32(SEQUENCE_FIELD_BITS)?;
        let ack_history = stream.read_u64(layout.ack_redundancy)?;

        let ack_time = if layout.round_trip_hint {
            stream.read_u16(ROUND_TRIP_HINT_BITS)?
        } else {
            0
        };

        let clock = if with_clock {
            Some(stream.read_u32(CLOCK_BITS)?)
        } else {
            None
        };

        Ok(Self {
            object_sequence: object_field >> 1,
            ack_sequence: ack_field >> 1,
            ack_history,
            ack_time,
            is_object: object_field & 1 == 1,
            clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> HeaderLayout {
        HeaderLayout {
            ack_redundancy: 64,
            round_trip_hint: true,
        }
    }

    #[test]
    fn test_header_bit_size() {
        assert_eq!(layout().bit_size(false), 112);
        assert_eq!(layout().bit_size(true), 144);

        let small = HeaderLayout {
            ack_redundancy: 32,
            round_trip_hint: false,
        };
        assert_eq!(small.bit_size(false), 64);
    }

    #[test]
    fn test_object_flag_in_first_byte() {
        let header = Header {
            object_sequence: 0x1234,
            ack_sequence: SEQUENCE_MASK,
            ack_history: 0b1011,
            ack_time: 17,
            is_object: true,
            clock: None,
        };

        let mut stream = BitStream::with_length(1024);
        stream.set_position(layout().bit_size(false));
        header.pack(&mut stream, &layout());

        assert_eq!(stream.position(), 112);
        assert!(Header::peek_is_object(stream.data()));
        assert_eq!(stream.data()[0], ((0x1234u32 << 1) | 1) as u8);

        let mut reader = BitStream::from_bytes(stream.written());
        let parsed = Header::unpack(&mut reader, &layout(), false).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(reader.position(), 112);
    }

    #[test]
    fn test_clock_field_and_truncation() {
        let header = Header {
            object_sequence: 0,
            ack_sequence: 9,
            ack_history: u64::MAX,
            ack_time: 0,
            is_object: false,
            clock: Some(123_456),
        };

        let mut stream = BitStream::with_length(256);
        stream.set_position(layout().bit_size(true));
        header.pack(&mut stream, &layout());
        assert!(!Header::peek_is_object(stream.data()));

        let bytes = stream.written().to_vec();
        let mut reader = BitStream::from_bytes(&bytes);
        assert_eq!(Header::unpack(&mut reader, &layout(), true).unwrap(), header);

        let mut truncated = BitStream::from_bytes(&bytes[..10]);
        assert!(Header::unpack(&mut truncated, &layout(), true).is_err());
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(CommandType::try_from(1).unwrap(), CommandType::Connect);
        assert_eq!(CommandType::try_from(5).unwrap(), CommandType::Ping);
        assert!(matches!(CommandType::try_from(0), Err(Error::UnknownCommand(0))));
    }
}
