//! Splitting one /dev/diag read into the messages packed inside it.
//!
//! A user-space batch is a `BatchHeader` followed by `num_messages` records,
//! each prefixed with an i32 length. A negative length means the real length
//! is the u32 right after it, so the header is 8 bytes instead of 4.

use bytes::Buf;
use deku::prelude::*;
use log::debug;
use thiserror::Error;

use crate::diag::{BatchHeader, DataType};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DemuxError {
    #[error("Batch of {0} bytes is too short for its header")]
    ShortBatch(usize),
    #[error("Message {index} at offset {offset} runs past the end of the {len} byte batch")]
    Truncated { index: u32, offset: usize, len: usize },
    #[error("No message left in the batch")]
    NoMessage,
}

/// One message and, if it was the last one of its batch, the time the batch
/// was read.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagMessage<'a> {
    pub data: &'a [u8],
    pub stamp: Option<u64>,
}

/// Cursor state for walking a batch. The batch itself stays in the caller's
/// buffer and is handed back in on every call.
#[derive(Debug, Default)]
pub struct BatchDemux {
    cursor: usize,
    index: u32,
    count: u32,
    stamp: u64,
}

impl BatchDemux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_exhausted(&self) -> bool {
        self.index >= self.count
    }

    /// Starts walking `batch`, read at `stamp`. Returns `false` for batches
    /// that aren't user-space data, which leaves the demux exhausted.
    pub fn load(&mut self, batch: &[u8], stamp: u64) -> Result<bool, DemuxError> {
        self.reset();
        // only user-space batches need the full header
        let (_, data_type) = DataType::from_bytes((batch, 0))
            .map_err(|_| DemuxError::ShortBatch(batch.len()))?;
        if data_type != DataType::UserSpace {
            debug!("skipping non-userspace batch {:?}", data_type);
            return Ok(false);
        }
        if batch.len() < BatchHeader::LEN {
            return Err(DemuxError::ShortBatch(batch.len()));
        }
        let (_, header) = BatchHeader::from_bytes((batch, 0))
            .map_err(|_| DemuxError::ShortBatch(batch.len()))?;
        self.cursor = BatchHeader::LEN;
        self.count = header.num_messages;
        self.stamp = stamp;
        Ok(true)
    }

    /// Yields the next message of the batch most recently passed to `load`.
    /// On error the demux is reset, so the rest of the batch is dropped.
    pub fn next_message<'a>(&mut self, batch: &'a [u8]) -> Option<Result<DiagMessage<'a>, DemuxError>> {
        if self.is_exhausted() {
            return None;
        }
        let result = self.parse_record(batch);
        if result.is_err() {
            self.reset();
        }
        Some(result)
    }

    fn parse_record<'a>(&mut self, batch: &'a [u8]) -> Result<DiagMessage<'a>, DemuxError> {
        let truncated = DemuxError::Truncated {
            index: self.index,
            offset: self.cursor,
            len: batch.len(),
        };
        let mut header = batch.get(self.cursor..).ok_or_else(|| truncated.clone())?;
        if header.remaining() < 4 {
            return Err(truncated);
        }
        let (header_len, len) = match header.get_i32_le() {
            len if len >= 0 => (4, len as usize),
            _ => {
                if header.remaining() < 4 {
                    return Err(truncated);
                }
                (8, header.get_u32_le() as usize)
            }
        };

        let start = self.cursor + header_len;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= batch.len())
            .ok_or(truncated)?;
        self.cursor = end;
        self.index += 1;

        let stamp = (self.index == self.count).then_some(self.stamp);
        Ok(DiagMessage {
            data: &batch[start..end],
            stamp,
        })
    }
}
