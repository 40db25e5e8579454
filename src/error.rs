//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// rudpkit 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("유효하지 않은 윈도우 크기: {capacity} (4 ~ 16384 사이의 2의 거듭제곱이어야 함)")]
    InvalidWindow { capacity: usize },

    #[error("유효하지 않은 시퀀스 비트 수: {bits} (4 ~ 32)")]
    InvalidSequenceBits { bits: u32 },

    #[error("스트림 언더플로우: {needed} 비트 필요, {available} 비트 남음")]
    StreamUnderflow { needed: usize, available: usize },

    #[error("알 수 없는 명령 코드: {0}")]
    UnknownCommand(u8),

    #[error("코덱 에러: {0}")]
    Codec(String),

    #[error("이미 존재하는 연결: {0}")]
    ConnectionExists(SocketAddr),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
