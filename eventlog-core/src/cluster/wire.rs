//! Peer wire codec.
//!
//! A multipart message is `[part count: u32 LE]` followed by each part as
//! `[length: u32 LE][bytes]`. Cluster frames use exactly two parts,
//! `[topic, payload]`.

use crate::error::{EventLogError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const MAX_PARTS: usize = 16;
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct MultipartCodec;

impl Decoder for MultipartCodec {
    type Item = Vec<Bytes>;
    type Error = EventLogError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let count = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if count > MAX_PARTS {
            return Err(EventLogError::Protocol(format!(
                "multipart message with {} parts exceeds {}",
                count, MAX_PARTS
            )));
        }

        // Walk the headers without consuming until the whole message is here.
        let mut offset = 4;
        for _ in 0..count {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let len = u32::from_le_bytes([
                src[offset],
                src[offset + 1],
                src[offset + 2],
                src[offset + 3],
            ]) as usize;
            offset += 4 + len;
            if offset > MAX_MESSAGE_SIZE {
                return Err(EventLogError::Protocol(format!(
                    "multipart message exceeds {} bytes",
                    MAX_MESSAGE_SIZE
                )));
            }
            if src.len() < offset {
                src.reserve(offset - src.len());
                return Ok(None);
            }
        }

        src.advance(4);
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let len = src.get_u32_le() as usize;
            parts.push(src.split_to(len).freeze());
        }
        Ok(Some(parts))
    }
}

impl Encoder<Vec<Bytes>> for MultipartCodec {
    type Error = EventLogError;

    fn encode(&mut self, parts: Vec<Bytes>, dst: &mut BytesMut) -> Result<()> {
        if parts.len() > MAX_PARTS {
            return Err(EventLogError::Protocol(format!(
                "cannot encode {} parts",
                parts.len()
            )));
        }
        let size: usize = 4 + parts.iter().map(|part| 4 + part.len()).sum::<usize>();
        if size > MAX_MESSAGE_SIZE {
            return Err(EventLogError::Protocol(format!(
                "multipart message of {} bytes exceeds {}",
                size, MAX_MESSAGE_SIZE
            )));
        }

        dst.reserve(size);
        dst.put_u32_le(parts.len() as u32);
        for part in parts {
            dst.put_u32_le(part.len() as u32);
            dst.put_slice(&part);
        }
        Ok(())
    }
}
