//! Repairing the modem's own timestamps in a captured data log.
//!
//! While capturing, the stamp log records `(offset, stamp)` anchors: the
//! bytes of the data log from `offset` up to the next anchor were read at
//! wall-clock time `stamp`. The corrector walks the data log from its end,
//! shifts the device-clock timestamp inside every log frame so that it agrees
//! with its anchor, and re-encodes the frames in their original order.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Buf;
use chrono::{DateTime, TimeZone, Utc};
use deku::prelude::*;
use log::{debug, info, warn};
use thiserror::Error;

use crate::hdlc::{hdlc_decapsulate, hdlc_encapsulate, HdlcError, MESSAGE_TERMINATOR};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// The modem clock runs at 52.4288 MHz...
pub const DEVICE_TICKS_PER_SEC: u64 = 52_428_800;
/// ...counting from the GPS epoch, 1980-01-06.
pub const DEVICE_EPOCH_OFFSET_SECS: u64 = 315_936_000;

/// Headers a multi-subsystem frame may carry in front of the log command.
const MULTI_SUBSYS_PREFIXES: [u64; 2] = [0x2_0000_0198, 0x1_0000_0198];
const MULTI_SUBSYS_PREFIX_LEN: usize = 8;
const LOG_CMD: u8 = 0x10;
/// Bytes from the log command to the timestamp: command, "more" flag, outer
/// length, inner length and log code.
const LOG_HEADER_LEN: usize = 8;
const TIMESTAMP_LEN: usize = 8;

/// A re-encoded frame differs only in its timestamp and checksum, which can
/// take at most this many more escape bytes than before.
const MAX_FRAME_GROWTH: usize = TIMESTAMP_LEN + 2;

/// One stamp log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct AnchorRecord {
    pub offset: u64,
    pub stamp: u64,
}

impl AnchorRecord {
    pub const LEN: usize = 16;
}

/// Converts POSIX nanoseconds to device clock ticks. Wraps rather than
/// failing for times before the device epoch.
pub fn device_ticks(posix_ns: u64) -> u64 {
    let secs = posix_ns / NANOS_PER_SEC;
    let subsec = posix_ns % NANOS_PER_SEC;
    secs.wrapping_sub(DEVICE_EPOCH_OFFSET_SECS)
        .wrapping_mul(DEVICE_TICKS_PER_SEC)
        .wrapping_add(subsec * DEVICE_TICKS_PER_SEC / NANOS_PER_SEC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTimestamp(pub u64);

impl DeviceTimestamp {
    pub fn from_posix_ns(posix_ns: u64) -> Self {
        DeviceTimestamp(device_ticks(posix_ns))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let secs = self.0 / DEVICE_TICKS_PER_SEC + DEVICE_EPOCH_OFFSET_SECS;
        let nanos = (self.0 % DEVICE_TICKS_PER_SEC) * NANOS_PER_SEC / DEVICE_TICKS_PER_SEC;
        Utc.timestamp_opt(i64::try_from(secs).ok()?, nanos as u32).single()
    }
}

/// Why a frame was left out of the corrected log.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("corrupted frame ({0})")]
    Corrupt(#[from] HdlcError),
    #[error("not a timestamped log frame")]
    UnsupportedShape,
    #[error("no anchor at or before it")]
    NoAnchor,
}

#[derive(Debug, Error)]
pub enum CorrectorError {
    #[error("Failed to access {path:?} ({source})")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to allocate the output buffer")]
    AllocationFailed,
    #[error("The data log is empty")]
    EmptyDataLog,
    #[error("The stamp log holds no anchors")]
    NoAnchors,
}

/// What happened to each frame. Offsets are frame starts in the input, in
/// ascending order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionReport {
    pub frames_written: usize,
    pub corrupt: Vec<usize>,
    pub unsupported: Vec<usize>,
    pub unanchored: Vec<usize>,
}

impl CorrectionReport {
    pub fn discarded(&self) -> usize {
        self.corrupt.len() + self.unsupported.len() + self.unanchored.len()
    }

    fn record_discard(&mut self, start: usize, err: &FrameError) {
        match err {
            FrameError::Corrupt(_) => self.corrupt.push(start),
            FrameError::UnsupportedShape => self.unsupported.push(start),
            FrameError::NoAnchor => self.unanchored.push(start),
        }
    }

    fn finish(&mut self) {
        self.corrupt.reverse();
        self.unsupported.reverse();
        self.unanchored.reverse();
    }
}

/// Reads a stamp log. A trailing partial record is ignored.
pub fn parse_anchors(bytes: &[u8]) -> Vec<AnchorRecord> {
    let records = bytes.chunks_exact(AnchorRecord::LEN);
    let leftover = records.remainder().len();
    if leftover > 0 {
        warn!("ignoring {} trailing bytes of a partial anchor record", leftover);
    }
    records
        .map(|mut record| AnchorRecord {
            offset: record.get_u64_le(),
            stamp: record.get_u64_le(),
        })
        .collect()
}

/// Where the device timestamp sits in a decoded frame, if it is a log frame.
fn timestamp_offset(frame: &[u8]) -> Option<usize> {
    let mut offset = 0;
    if frame.len() >= MULTI_SUBSYS_PREFIX_LEN
        && MULTI_SUBSYS_PREFIXES.contains(&(&frame[..MULTI_SUBSYS_PREFIX_LEN]).get_u64_le())
    {
        offset = MULTI_SUBSYS_PREFIX_LEN;
    }
    if frame.len() < offset + 2 || frame[offset] != LOG_CMD {
        return None;
    }
    offset += LOG_HEADER_LEN;
    (frame.len() >= offset + TIMESTAMP_LEN).then_some(offset)
}

/// Walks terminator-inclusive frames from the back of a buffer, yielding
/// each with its start offset. Bytes after the last terminator are skipped.
struct ReverseFrames<'a> {
    data: &'a [u8],
    end: usize,
}

impl<'a> ReverseFrames<'a> {
    fn new(data: &'a [u8]) -> Self {
        let end = data
            .iter()
            .rposition(|&b| b == MESSAGE_TERMINATOR)
            .map_or(0, |i| i + 1);
        ReverseFrames { data, end }
    }
}

impl<'a> Iterator for ReverseFrames<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.end == 0 {
            return None;
        }
        let start = self.data[..self.end - 1]
            .iter()
            .rposition(|&b| b == MESSAGE_TERMINATOR)
            .map_or(0, |i| i + 1);
        let frame = &self.data[start..self.end];
        self.end = start;
        Some((start, frame))
    }
}

/// Output assembled from the back so frames found in reverse come out in
/// their original order.
struct ReverseWriter {
    buf: Vec<u8>,
    start: usize,
}

impl ReverseWriter {
    fn with_capacity(capacity: usize) -> Result<Self, CorrectorError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| CorrectorError::AllocationFailed)?;
        buf.resize(capacity, 0);
        Ok(ReverseWriter { buf, start: capacity })
    }

    fn prepend(&mut self, bytes: &[u8]) -> Result<(), CorrectorError> {
        let start = self
            .start
            .checked_sub(bytes.len())
            .ok_or(CorrectorError::AllocationFailed)?;
        self.buf[start..self.start].copy_from_slice(bytes);
        self.start = start;
        Ok(())
    }

    fn into_vec(mut self) -> Vec<u8> {
        self.buf.drain(..self.start);
        self.buf
    }
}

/// Picks anchors for frames visited back to front.
struct AnchorCursor<'a> {
    anchors: &'a [AnchorRecord],
    cursor: usize,
    // index of the anchor the delta was computed for
    current: Option<(usize, u64)>,
}

impl<'a> AnchorCursor<'a> {
    fn new(anchors: &'a [AnchorRecord]) -> Self {
        AnchorCursor {
            anchors,
            cursor: anchors.len(),
            current: None,
        }
    }

    /// The delta to add to the raw timestamp of the frame starting at
    /// `start`, recomputed from that frame whenever its anchor changes.
    fn delta(&mut self, start: usize, raw: u64) -> Result<u64, FrameError> {
        while self.cursor > 0 && self.anchors[self.cursor - 1].offset > start as u64 {
            self.cursor -= 1;
        }
        let index = self.cursor.checked_sub(1).ok_or(FrameError::NoAnchor)?;
        match self.current {
            Some((current, delta)) if current == index => Ok(delta),
            _ => {
                let anchor = &self.anchors[index];
                let ticks = device_ticks(anchor.stamp);
                let delta = ticks.wrapping_sub(raw);
                debug!(
                    "anchor {} at offset {}: device time {:?}, delta {}",
                    index,
                    anchor.offset,
                    DeviceTimestamp(ticks).to_datetime(),
                    delta as i64
                );
                self.current = Some((index, delta));
                Ok(delta)
            }
        }
    }
}

fn correct_frame(encoded: &[u8], start: usize, anchors: &mut AnchorCursor) -> Result<Vec<u8>, FrameError> {
    let mut frame = hdlc_decapsulate(encoded)?;
    let at = timestamp_offset(&frame).ok_or(FrameError::UnsupportedShape)?;
    let field = &mut frame[at..at + TIMESTAMP_LEN];
    let raw = (&field[..]).get_u64_le();
    let delta = anchors.delta(start, raw)?;
    field.copy_from_slice(&raw.wrapping_add(delta).to_le_bytes());
    Ok(hdlc_encapsulate(&frame))
}

/// Corrects every log frame in `data` against `anchors`, which must be in
/// non-decreasing offset order. Frames that are corrupt, are not log frames,
/// or start before the first anchor are left out, each with a warning.
pub fn correct(data: &[u8], anchors: &[AnchorRecord]) -> Result<(Vec<u8>, CorrectionReport), CorrectorError> {
    if data.is_empty() {
        return Err(CorrectorError::EmptyDataLog);
    }
    if anchors.is_empty() {
        return Err(CorrectorError::NoAnchors);
    }

    let frames = data.iter().filter(|&&b| b == MESSAGE_TERMINATOR).count();
    let mut out = ReverseWriter::with_capacity(data.len() + frames * MAX_FRAME_GROWTH)?;
    let mut cursor = AnchorCursor::new(anchors);
    let mut report = CorrectionReport::default();

    for (start, encoded) in ReverseFrames::new(data) {
        match correct_frame(encoded, start, &mut cursor) {
            Ok(frame) => {
                out.prepend(&frame)?;
                report.frames_written += 1;
            }
            Err(err) => {
                warn!("discarding frame at {}: {}", start, err);
                report.record_discard(start, &err);
            }
        }
    }

    report.finish();
    Ok((out.into_vec(), report))
}

fn read_file(path: &Path) -> Result<Vec<u8>, CorrectorError> {
    fs::read(path).map_err(|source| CorrectorError::FileIo {
        path: path.to_path_buf(),
        source,
    })
}

/// Corrects the data log at `data_path` against the stamp log at
/// `stamp_path` and writes the result to `out_path`.
pub fn correct_files<P, Q, R>(data_path: P, stamp_path: Q, out_path: R) -> Result<CorrectionReport, CorrectorError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let data = read_file(data_path.as_ref())?;
    let anchors = parse_anchors(&read_file(stamp_path.as_ref())?);
    info!("correcting {} bytes against {} anchors", data.len(), anchors.len());

    let (corrected, report) = correct(&data, &anchors)?;
    fs::write(out_path.as_ref(), &corrected).map_err(|source| CorrectorError::FileIo {
        path: out_path.as_ref().to_path_buf(),
        source,
    })?;
    info!(
        "wrote {} frames ({} bytes), discarded {}",
        report.frames_written,
        corrected.len(),
        report.discarded()
    );
    Ok(report)
}
