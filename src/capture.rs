//! Persisting a live capture as pairs of files: the data log (`.dlog`) holds
//! every message back to back, and the stamp log (`.tlog`) holds
//! `AnchorRecord`s tying byte offsets in the data log to wall-clock time.

use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use deku::prelude::*;
use log::{debug, info, warn};
use thiserror::Error;

use crate::config::CaptureConfig;
use crate::stamp::AnchorRecord;
use crate::transport::{Batch, DiagTransport, TransportError};

pub const MAX_LOG_INDEX: u32 = 9999;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open {path:?} ({source})")]
    CreateFailed { path: PathBuf, source: io::Error },
    #[error("Failed to write to {path:?} ({source})")]
    WriteFailed { path: PathBuf, source: io::Error },
    #[error("Failed to encode anchor: {0}")]
    Encoding(#[from] DekuError),
    #[error("The number of the log files has overflowed")]
    TooManyFiles,
    #[error("Diag read error: {0}")]
    Transport(#[from] TransportError),
    #[error("Read an empty message from {0}")]
    EmptyMessage(String),
}

/// `<prefix>.NNNN.dlog` and `<prefix>.NNNN.tlog`, counting up from 0000.
#[derive(Debug, Clone, PartialEq)]
pub struct LogNames {
    data_prefix: String,
    stamp_prefix: String,
    index: u32,
}

impl LogNames {
    pub fn new(data_prefix: impl Into<String>, stamp_prefix: impl Into<String>) -> Self {
        LogNames {
            data_prefix: data_prefix.into(),
            stamp_prefix: stamp_prefix.into(),
            index: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn data_log(&self) -> PathBuf {
        PathBuf::from(format!("{}.{:04}.dlog", self.data_prefix, self.index))
    }

    pub fn stamp_log(&self) -> PathBuf {
        PathBuf::from(format!("{}.{:04}.tlog", self.stamp_prefix, self.index))
    }

    pub fn advance(&mut self) -> Result<(), CaptureError> {
        if self.index >= MAX_LOG_INDEX {
            return Err(CaptureError::TooManyFiles);
        }
        self.index += 1;
        Ok(())
    }
}

fn create(path: PathBuf) -> Result<(File, PathBuf), CaptureError> {
    match File::create(&path) {
        Ok(file) => Ok((file, path)),
        Err(source) => Err(CaptureError::CreateFailed { path, source }),
    }
}

/// One data log / stamp log pair.
///
/// Only the last message of a read batch carries a stamp. An anchor covers
/// every message since the previous anchor and carries the stamp of the last
/// batch among them, placed at the offset where the first of them starts.
/// The last message under each anchor is then always the one its stamp timed.
/// Messages of a batch cut short when the capture stops share the last anchor.
pub struct CaptureWriter {
    data_log: File,
    data_path: PathBuf,
    stamp_log: File,
    stamp_path: PathBuf,
    pub total_written: u64,
    anchor_interval_ns: u64,
    region_start: Option<u64>,
    pending: Option<AnchorRecord>,
    first_anchor: Option<u64>,
    last_anchor: Option<u64>,
}

impl CaptureWriter {
    /// Creates (or truncates) both files named by `names`.
    pub fn create(names: &LogNames, anchor_interval: Duration) -> Result<Self, CaptureError> {
        let (data_log, data_path) = create(names.data_log())?;
        let (stamp_log, stamp_path) = create(names.stamp_log())?;
        Ok(CaptureWriter {
            data_log,
            data_path,
            stamp_log,
            stamp_path,
            total_written: 0,
            anchor_interval_ns: duration_ns(anchor_interval),
            region_start: None,
            pending: None,
            first_anchor: None,
            last_anchor: None,
        })
    }

    pub fn first_anchor(&self) -> Option<u64> {
        self.first_anchor
    }

    /// Whether a message stamped `stamp` is `rotate_ns` or more past this
    /// pair's first anchor. Zero never rotates.
    pub fn rotation_due(&self, stamp: u64, rotate_ns: u64) -> bool {
        rotate_ns > 0
            && self
                .first_anchor
                .is_some_and(|first| stamp.saturating_sub(first) >= rotate_ns)
    }

    /// Appends one message. A stamped message closes its batch, and the
    /// anchor covering it is written once the anchor interval has passed
    /// since the last anchor, or right away with `force_anchor`. Returns
    /// whether an anchor was written.
    pub fn record(&mut self, data: &[u8], stamp: Option<u64>, force_anchor: bool) -> Result<bool, CaptureError> {
        let region_start = *self.region_start.get_or_insert(self.total_written);
        self.data_log
            .write_all(data)
            .map_err(|source| CaptureError::WriteFailed { path: self.data_path.clone(), source })?;
        self.total_written += data.len() as u64;

        let Some(stamp) = stamp else {
            return Ok(false);
        };
        self.pending = Some(AnchorRecord {
            offset: region_start,
            stamp,
        });
        let due = force_anchor
            || match self.last_anchor {
                Some(last) => stamp.saturating_sub(last) >= self.anchor_interval_ns,
                None => true,
            };
        if due {
            self.finish()?;
        }
        Ok(due)
    }

    /// Writes the anchor for stamped batches not covered by one yet.
    pub fn finish(&mut self) -> Result<(), CaptureError> {
        if let Some(record) = self.pending.take() {
            self.region_start = None;
            self.anchor(record)?;
        }
        Ok(())
    }

    pub fn anchor(&mut self, record: AnchorRecord) -> Result<(), CaptureError> {
        let bytes = record.to_bytes()?;
        self.stamp_log
            .write_all(&bytes)
            .map_err(|source| CaptureError::WriteFailed { path: self.stamp_path.clone(), source })?;
        self.first_anchor.get_or_insert(record.stamp);
        self.last_anchor = Some(record.stamp);
        Ok(())
    }
}

fn duration_ns(duration: Duration) -> u64 {
    duration.as_nanos().try_into().unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureOptions {
    pub anchor_interval: Duration,
    /// Zero never rotates.
    pub rotate_interval: Duration,
}

impl From<&CaptureConfig> for CaptureOptions {
    fn from(config: &CaptureConfig) -> Self {
        CaptureOptions {
            anchor_interval: Duration::from_millis(config.anchor_interval_ms),
            rotate_interval: Duration::from_millis(config.rotate_interval_ms),
        }
    }
}

// Moves one message into `writer`. Returns whether the pair is due for
// rotation, in which case its last anchor has been written.
fn capture_message<T>(transport: &mut T, writer: &mut CaptureWriter, rotate_ns: u64) -> Result<bool, CaptureError>
where
    T: DiagTransport + ?Sized,
{
    let Batch { data, stamp } = transport.read()?;
    if data.is_empty() {
        return Err(CaptureError::EmptyMessage(transport.name().to_string()));
    }
    let rotate = stamp.is_some_and(|stamp| writer.rotation_due(stamp, rotate_ns));
    writer.record(data, stamp, rotate)?;
    Ok(rotate)
}

/// Reads from `transport` into log files until something fails.
///
/// A new file pair is started once a stamped message arrives at least
/// `rotate_interval` after the current pair's first anchor. That message is
/// always anchored before its pair is closed, and offsets start over at 0 in
/// the next pair, so each pair can be corrected on its own. When the capture
/// stops, the anchor still owed for the messages since the last one is
/// written before the error is returned.
pub fn run_capture<T>(
    transport: &mut T,
    names: &mut LogNames,
    options: &CaptureOptions,
) -> Result<Infallible, CaptureError>
where
    T: DiagTransport + ?Sized,
{
    let rotate_ns = duration_ns(options.rotate_interval);
    let mut writer = CaptureWriter::create(names, options.anchor_interval)?;
    info!("writing {:?} and {:?}", names.data_log(), names.stamp_log());

    loop {
        match capture_message(transport, &mut writer, rotate_ns) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                if let Err(finish_err) = writer.finish() {
                    warn!("couldn't write the final anchor ({})", finish_err);
                }
                return Err(err);
            }
        }

        debug!("closing {:?} at {} bytes", names.data_log(), writer.total_written);
        names.advance()?;
        writer = CaptureWriter::create(names, options.anchor_interval)?;
        info!("rotated to {:?}", names.data_log());
    }
}
