//! Frame codec
//!
//! Every message on a group or client connection is framed as
//! `[length: u32][crc32: u32][payload]`, both header fields little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Payload length
    pub length: u32,
    /// Payload checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [a, b, c, d, e, f, g, h] = *bytes;
        Self {
            length: u32::from_le_bytes([a, b, c, d]),
            checksum: u32::from_le_bytes([e, f, g, h]),
        }
    }
}

/// Checksummed, length-prefixed frames with a size limit
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < FrameHeader::SIZE {
            return Ok(None);
        }

        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(&src[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&header_bytes);
        let length = header.length as usize;

        if length > self.max_frame_size {
            return Err(Error::Network(format!(
                "frame of {} bytes exceeds limit of {}",
                length, self.max_frame_size
            )));
        }

        if src.len() < FrameHeader::SIZE + length {
            src.reserve(FrameHeader::SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(FrameHeader::SIZE);
        let payload = src.split_to(length).freeze();

        if crc32fast::hash(&payload) != header.checksum {
            return Err(Error::Network("Message checksum mismatch".into()));
        }
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_size {
            return Err(Error::Network(format!(
                "frame of {} bytes exceeds limit of {}",
                item.len(),
                self.max_frame_size
            )));
        }
        let header = FrameHeader::new(&item);
        dst.reserve(FrameHeader::SIZE + item.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&item);
        Ok(())
    }
}
