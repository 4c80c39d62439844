//! What the capture loop needs from a diag link, and picking one at startup.

use std::io;

use deku::DekuError;
use log::{debug, error, info};
use thiserror::Error;

use crate::config::{CaptureConfig, TransportKind};
use crate::diag_device::DiagDevice;
use crate::diag_reader::DemuxError;
use crate::hdlc::{split_frames, MIN_FRAME_LEN};
use crate::negotiation::{LoggingFallback, NegotiationError};
use crate::serial::SerialLink;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot open {path} ({source})")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to enable logging on {path}: {source}")]
    NegotiationFailed {
        path: String,
        #[source]
        source: NegotiationError,
    },
    #[error("No diag transport could be opened")]
    NoTransport,
    #[error("Failed to read from {path} ({source})")]
    ReadFailed {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write into {path} ({source})")]
    WriteFailed {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Wrote {written} of {expected} bytes into {path}")]
    ShortWrite {
        path: String,
        written: usize,
        expected: usize,
    },
    #[error("Failed to receive responses from {path} (Empty response)")]
    EmptyResponse { path: String },
    #[error("Malformed batch from {path}: {source}")]
    MalformedBatch {
        path: String,
        #[source]
        source: DemuxError,
    },
    #[error("Failed to encode request: {0}")]
    Encoding(#[from] DekuError),
}

/// One message handed out by a transport. `stamp` is the POSIX time in
/// nanoseconds the underlying read completed, when known for this message.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<'a> {
    pub data: &'a [u8],
    pub stamp: Option<u64>,
}

pub trait DiagTransport {
    /// The device node behind this transport, for diagnostics.
    fn name(&self) -> &str;

    /// Sends one encoded command frame and drains the device's response.
    /// Returns how many bytes of `frame` were sent.
    fn write(&mut self, frame: &[u8]) -> Result<usize, TransportError>;

    /// Blocks until the next message is available.
    fn read(&mut self) -> Result<Batch<'_>, TransportError>;

    /// Releases anything acquired while opening. Safe to call more than once.
    fn close(&mut self);
}

/// Tries each configured transport in order and keeps the first one that
/// opens.
pub fn open_transport(
    config: &CaptureConfig,
    mut fallback: Option<&mut dyn LoggingFallback>,
) -> Result<Box<dyn DiagTransport>, TransportError> {
    for kind in &config.transports {
        let opened: Result<Box<dyn DiagTransport>, TransportError> = match kind {
            TransportKind::Char => DiagDevice::open(
                &config.diag_device_path,
                config.read_buffer_size,
                fallback.as_mut().map(|f| &mut **f as &mut dyn LoggingFallback),
            )
            .map(|dev| Box::new(dev) as Box<dyn DiagTransport>),
            TransportKind::Serial => SerialLink::open(
                &config.serial_device_path,
                config.read_buffer_size,
                config.serial_drop_leading_frames,
            )
            .map(|link| Box::new(link) as Box<dyn DiagTransport>),
        };
        match opened {
            Ok(transport) => {
                info!("using {:?} transport on {}", kind, transport.name());
                return Ok(transport);
            }
            Err(err) => error!("{}", err),
        }
    }
    Err(TransportError::NoTransport)
}

/// Sends every complete frame in `commands`, in order. Bytes after the last
/// terminator are ignored and so are chunks too short to be a frame. Returns
/// the number of frames sent.
pub fn write_commands<T>(transport: &mut T, commands: &[u8]) -> Result<usize, TransportError>
where
    T: DiagTransport + ?Sized,
{
    let mut sent = 0;
    for frame in split_frames(commands) {
        if frame.len() < MIN_FRAME_LEN {
            debug!("skipping {} byte command chunk", frame.len());
            continue;
        }
        let written = transport.write(frame)?;
        if written != frame.len() {
            return Err(TransportError::ShortWrite {
                path: transport.name().to_string(),
                written,
                expected: frame.len(),
            });
        }
        sent += 1;
    }
    Ok(sent)
}
