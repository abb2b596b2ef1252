//! Checksummed MessagePack frames
//!
//! Frame layout:
//! - Length: u32 (4 bytes) - length of serialized value
//! - Data: serialized value (msgpack)
//! - CRC32: u32 (4 bytes) - checksum of length + data
//!
//! Used both on the wire between workers and inside artifact files.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on a single frame body sent between workers (1 GiB)
pub const MAX_FRAME_LEN: u32 = 1024 * 1024 * 1024;

const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 4;

fn checksum(length: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&length.to_be_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Serialize `value` into a standalone msgpack body
pub fn to_msgpack<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec(value).map_err(|e| Error::codec(format!("Failed to serialize: {}", e)))
}

/// Deserialize a msgpack body produced by [`to_msgpack`]
pub fn from_msgpack<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data).map_err(|e| Error::codec(format!("Failed to deserialize: {}", e)))
}

/// Encode `value` into a complete frame of at most [`MAX_FRAME_LEN`] bytes
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    encode_frame_within(value, MAX_FRAME_LEN)
}

/// Encode `value` into a complete frame whose body is at most `max_len` bytes
pub fn encode_frame_within<T: Serialize + ?Sized>(value: &T, max_len: u32) -> Result<Bytes> {
    let data = to_msgpack(value)?;
    if data.len() > max_len as usize {
        return Err(Error::codec(format!(
            "Frame of {} bytes exceeds limit of {} bytes",
            data.len(),
            max_len
        )));
    }

    let length = data.len() as u32;
    let mut buffer = BytesMut::with_capacity(HEADER_LEN + data.len() + TRAILER_LEN);
    buffer.put_u32(length);
    buffer.put_slice(&data);
    buffer.put_u32(checksum(length, &data));

    Ok(buffer.freeze())
}

/// Decode a complete frame, verifying its length and checksum
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    decode_frame_within(frame, MAX_FRAME_LEN)
}

/// [`decode_frame`] for frames produced by [`encode_frame_within`]
pub fn decode_frame_within<T: DeserializeOwned>(frame: &[u8], max_len: u32) -> Result<T> {
    if frame.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::codec(format!("Frame truncated at {} bytes", frame.len())));
    }

    let mut cursor = frame;
    let length = cursor.get_u32();
    if length > max_len {
        return Err(Error::codec(format!("Unreasonable frame length: {}", length)));
    }
    if cursor.len() != length as usize + TRAILER_LEN {
        return Err(Error::codec(format!(
            "Frame length mismatch: header says {} bytes, found {}",
            length,
            cursor.len().saturating_sub(TRAILER_LEN)
        )));
    }

    let (data, mut trailer) = cursor.split_at(length as usize);
    let stored_crc = trailer.get_u32();
    let calculated_crc = checksum(length, data);
    if stored_crc != calculated_crc {
        return Err(Error::codec(format!(
            "CRC mismatch (expected: {}, got: {})",
            stored_crc, calculated_crc
        )));
    }

    from_msgpack(data)
}

/// Write one frame and flush
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame written by [`write_frame`]
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let length = reader.read_u32().await?;
    if length > MAX_FRAME_LEN {
        return Err(Error::codec(format!("Unreasonable frame length: {}", length)));
    }

    let mut data = vec![0u8; length as usize];
    reader.read_exact(&mut data).await?;

    let stored_crc = reader.read_u32().await?;
    let calculated_crc = checksum(length, &data);
    if stored_crc != calculated_crc {
        return Err(Error::codec(format!(
            "CRC mismatch (expected: {}, got: {})",
            stored_crc, calculated_crc
        )));
    }

    from_msgpack(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Array, Detection};

    #[test]
    fn test_frame_roundtrip() {
        let detections = vec![Detection::new(0.0, 1.0, 10.0, 20.0, 0.75)];
        let frame = encode_frame(&detections).unwrap();
        let decoded: Vec<Detection> = decode_frame(&frame).unwrap();
        assert_eq!(decoded, detections);
    }

    #[test]
    fn test_corrupted_frame_detected() {
        let array = Array::float(vec![1, 3], vec![0.5, 0.25, 0.125]).unwrap();
        let mut frame = encode_frame(&array).unwrap().to_vec();
        frame[6] ^= 0xFF;

        let err = decode_frame::<Array>(&frame).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn test_truncated_frame_detected() {
        let frame = encode_frame(&vec![1u32, 2, 3]).unwrap();
        assert!(decode_frame::<Vec<u32>>(&frame[..frame.len() - 2]).is_err());
        assert!(decode_frame::<Vec<u32>>(&frame[..3]).is_err());
    }

    #[test]
    fn test_frame_limits() {
        let values = vec![0u8; 64];
        assert!(encode_frame_within(&values, 16).is_err());

        let frame = encode_frame_within(&values, 1024).unwrap();
        assert!(decode_frame_within::<Vec<u8>>(&frame, 16).is_err());
        assert_eq!(decode_frame_within::<Vec<u8>>(&frame, 1024).unwrap(), values);
        assert_eq!(decode_frame::<Vec<u8>>(&frame).unwrap(), values);
    }

    #[tokio::test]
    async fn test_stream_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, "first").await.unwrap();
        write_frame(&mut client, &vec![7i64, 8, 9]).await.unwrap();

        let first: String = read_frame(&mut server).await.unwrap();
        let second: Vec<i64> = read_frame(&mut server).await.unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, vec![7, 8, 9]);
    }
}
