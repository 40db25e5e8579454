//! 페이로드 코덱
//!
//! 애플리케이션 객체를 헤더 뒤 비트 스트림에 기록하고 읽어낸다.
//! 연결마다 코덱을 하나씩 복제해 쓰므로 상태를 가져도 된다.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::stream::BitStream;
use crate::{Error, Result};

/// 길이 접두사 폭 (비트)
const LENGTH_PREFIX_BITS: u32 = 16;

/// 페이로드 코덱
pub trait Codec: Clone + Send + 'static {
    /// 전송 객체 타입
    type Object: Clone + Send + 'static;

    /// 현재 커서 위치부터 객체 기록
    fn pack(&mut self, stream: &mut BitStream, object: &Self::Object) -> Result<()>;

    /// 현재 커서 위치부터 객체 읽기
    fn unpack(&mut self, stream: &mut BitStream) -> Result<Self::Object>;
}

fn write_prefixed(stream: &mut BitStream, payload: &[u8]) -> Result<()> {
    let len = u16::try_from(payload.len())
        .map_err(|_| Error::Codec(format!("페이로드가 너무 큼: {} bytes", payload.len())))?;
    stream.write_u16(len, LENGTH_PREFIX_BITS);
    stream.write_bytes(payload);
    Ok(())
}

fn read_prefixed(stream: &mut BitStream) -> Result<Vec<u8>> {
    let len = stream.read_u16(LENGTH_PREFIX_BITS)? as usize;
    stream.read_bytes(len)
}

/// 원시 바이트 코덱 (u16 길이 + 바이트)
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Object = Bytes;

    fn pack(&mut self, stream: &mut BitStream, object: &Bytes) -> Result<()> {
        write_prefixed(stream, object)
    }

    fn unpack(&mut self, stream: &mut BitStream) -> Result<Bytes> {
        Ok(Bytes::from(read_prefixed(stream)?))
    }
}

/// serde 타입용 bincode 코덱
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T> Codec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    type Object = T;

    fn pack(&mut self, stream: &mut BitStream, object: &T) -> Result<()> {
        let encoded = bincode::serialize(object)?;
        write_prefixed(stream, &encoded)
    }

    fn unpack(&mut self, stream: &mut BitStream) -> Result<T> {
        let encoded = read_prefixed(stream)?;
        Ok(bincode::deserialize(&encoded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat {
        from: String,
        text: String,
    }

    #[test]
    fn test_bytes_codec_after_unaligned_header() {
        let mut codec = BytesCodec;
        let mut stream = BitStream::with_length(512);
        stream.set_position(13);
        codec.pack(&mut stream, &Bytes::from_static(b"hello")).unwrap();

        let mut reader = BitStream::from_bytes(stream.written());
        reader.set_position(13);
        assert_eq!(codec.unpack(&mut reader).unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_bincode_codec() {
        let mut codec = BincodeCodec::<Chat>::new();
        let chat = Chat {
            from: "alice".into(),
            text: "안녕".into(),
        };

        let mut stream = BitStream::with_length(1024);
        stream.set_position(112);
        codec.pack(&mut stream, &chat).unwrap();

        let mut reader = BitStream::from_bytes(stream.written());
        reader.set_position(112);
        assert_eq!(codec.unpack(&mut reader).unwrap(), chat);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let mut codec = BytesCodec;
        let mut stream = BitStream::with_length(256);
        codec.pack(&mut stream, &Bytes::from_static(b"abcdef")).unwrap();

        let mut reader = BitStream::from_bytes(&stream.written()[..4]);
        assert!(codec.unpack(&mut reader).is_err());
    }
}
