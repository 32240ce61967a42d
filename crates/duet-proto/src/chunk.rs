//! Binary chunk frames for file transfer.
//!
//! `version | transfer id (u128 BE) | seq (u32 BE) | total (u32 BE) | payload`
//!
//! The file channel is unordered, so every frame names its slot and the
//! receiver only completes once it holds `total` distinct slots.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub const CHUNK_VERSION: u8 = 0xD1;
pub const HEADER_LEN: usize = 1 + 16 + 4 + 4;
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
    #[error("chunk payload too large: {0} bytes")]
    TooLarge(usize),
    #[error("chunk belongs to transfer {found:x}, expected {expected:x}")]
    WrongTransfer { expected: u128, found: u128 },
    #[error("chunk total {found} does not match announced {expected}")]
    TotalMismatch { expected: u32, found: u32 },
    #[error("transfer too large for u32 chunk indexes")]
    TooManyChunks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer: u128,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

impl ChunkFrame {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN.saturating_add(self.payload.len()));
        buf.extend_from_slice(&[CHUNK_VERSION]);
        buf.extend_from_slice(&self.transfer.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.total.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(bytes: &Bytes, max_payload: usize) -> Result<Self, ChunkError> {
        if bytes.first().copied() != Some(CHUNK_VERSION) {
            return Err(ChunkError::Malformed("unknown chunk version"));
        }
        if bytes.len() < HEADER_LEN {
            return Err(ChunkError::Malformed("chunk frame too short"));
        }
        let payload_len = bytes.len() - HEADER_LEN;
        if payload_len > max_payload {
            return Err(ChunkError::TooLarge(payload_len));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[1..17]);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&bytes[17..21]);
        let mut total = [0u8; 4];
        total.copy_from_slice(&bytes[21..25]);
        let frame = Self {
            transfer: u128::from_be_bytes(id),
            seq: u32::from_be_bytes(seq),
            total: u32::from_be_bytes(total),
            payload: bytes.slice(HEADER_LEN..),
        };
        if frame.total == 0 {
            return Err(ChunkError::Malformed("chunk total cannot be zero"));
        }
        if frame.seq >= frame.total {
            return Err(ChunkError::Malformed("chunk seq exceeds total"));
        }
        Ok(frame)
    }
}

/// Number of chunks needed for `size` bytes. Empty files have no chunks.
pub fn chunk_count(size: u64, chunk_bytes: usize) -> Result<u32, ChunkError> {
    let chunk_bytes = chunk_bytes.max(1) as u64;
    let count = size.div_ceil(chunk_bytes);
    u32::try_from(count).map_err(|_| ChunkError::TooManyChunks)
}

/// Splits a payload into frames without copying.
pub fn split(
    transfer: u128,
    payload: &Bytes,
    chunk_bytes: usize,
) -> Result<impl Iterator<Item = ChunkFrame> + '_, ChunkError> {
    let chunk_bytes = chunk_bytes.max(1);
    let total = chunk_count(payload.len() as u64, chunk_bytes)?;
    Ok((0..total).map(move |seq| {
        let start = seq as usize * chunk_bytes;
        let end = (start + chunk_bytes).min(payload.len());
        ChunkFrame {
            transfer,
            seq,
            total,
            payload: payload.slice(start..end),
        }
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Stored,
    Duplicate,
    Complete,
}

/// Collects the distinct chunks of one transfer.
#[derive(Debug)]
pub struct ChunkAssembler {
    transfer: u128,
    slots: Vec<Option<Bytes>>,
    distinct: u32,
    bytes: usize,
}

impl ChunkAssembler {
    pub fn new(transfer: u128, total: u32) -> Self {
        Self {
            transfer,
            slots: vec![None; total as usize],
            distinct: 0,
            bytes: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn distinct(&self) -> u32 {
        self.distinct
    }

    pub fn is_complete(&self) -> bool {
        self.distinct == self.total()
    }

    pub fn ingest(&mut self, frame: ChunkFrame) -> Result<Ingest, ChunkError> {
        if frame.transfer != self.transfer {
            return Err(ChunkError::WrongTransfer {
                expected: self.transfer,
                found: frame.transfer,
            });
        }
        if frame.total != self.total() {
            return Err(ChunkError::TotalMismatch {
                expected: self.total(),
                found: frame.total,
            });
        }
        let slot = self
            .slots
            .get_mut(frame.seq as usize)
            .ok_or(ChunkError::Malformed("chunk seq exceeds total"))?;
        if slot.is_some() {
            return Ok(Ingest::Duplicate);
        }
        self.bytes = self.bytes.saturating_add(frame.payload.len());
        *slot = Some(frame.payload);
        self.distinct += 1;
        if self.is_complete() {
            Ok(Ingest::Complete)
        } else {
            Ok(Ingest::Stored)
        }
    }

    /// Joins the chunks in sequence order. Only valid once complete.
    pub fn assemble(&self) -> Result<Bytes, ChunkError> {
        let mut out = BytesMut::with_capacity(self.bytes);
        for slot in &self.slots {
            match slot {
                Some(payload) => out.extend_from_slice(payload),
                None => return Err(ChunkError::Malformed("missing chunk during reassembly")),
            }
        }
        Ok(out.freeze())
    }
}
