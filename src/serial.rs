//! The diag port some modems expose as a USB serial device.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use log::{debug, warn};
use nix::sys::termios::{self, BaudRate, ControlFlags, FlushArg, SetArg};

use crate::clock::posix_now_ns;
use crate::hdlc::MESSAGE_TERMINATOR;
use crate::transport::{Batch, DiagTransport, TransportError};

/// Throws away the first few terminator-delimited frames after the link is
/// (re)armed. The port may still hold the tail of whatever was sent before we
/// opened it, or the response to our last command.
#[derive(Debug, Clone)]
pub struct LeadingFrameFilter {
    count: u32,
    remaining: u32,
}

impl LeadingFrameFilter {
    pub fn new(count: u32) -> Self {
        LeadingFrameFilter {
            count,
            remaining: count,
        }
    }

    pub fn rearm(&mut self) {
        self.remaining = self.count;
    }

    pub fn is_dropping(&self) -> bool {
        self.remaining > 0
    }

    /// Returns where the kept part of `batch` starts, or `None` if all of it
    /// was dropped.
    pub fn filter(&mut self, batch: &[u8]) -> Option<usize> {
        if !self.is_dropping() {
            return Some(0);
        }
        for (i, &b) in batch.iter().enumerate() {
            if b == MESSAGE_TERMINATOR {
                self.remaining -= 1;
                if self.remaining == 0 {
                    return (i + 1 < batch.len()).then_some(i + 1);
                }
            }
        }
        None
    }
}

pub struct SerialLink<D = File> {
    dev: D,
    path: String,
    read_buf: Vec<u8>,
    leading: LeadingFrameFilter,
}

fn configure_raw(file: &File) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut tio);
    tio.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
    termios::cfsetospeed(&mut tio, BaudRate::B115200)?;
    termios::cfsetispeed(&mut tio, BaudRate::B115200)?;
    if let Err(err) = termios::tcflush(file, FlushArg::TCIOFLUSH) {
        warn!("failed to flush serial queues ({})", err);
    }
    termios::tcsetattr(file, SetArg::TCSANOW, &tio)
}

impl SerialLink<File> {
    /// Opens `path` as a raw 115200 baud link.
    pub fn open<P>(path: P, buffer_len: usize, drop_frames: u32) -> Result<Self, TransportError>
    where
        P: AsRef<Path>,
    {
        let path_str = path.as_ref().display().to_string();
        let open_failed = |source| TransportError::OpenFailed {
            path: path_str.clone(),
            source,
        };
        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&path)
            .map_err(open_failed)?;
        configure_raw(&file).map_err(|errno| open_failed(io::Error::from(errno)))?;
        Ok(SerialLink::from_device(file, path_str, buffer_len, drop_frames))
    }
}

impl<D> SerialLink<D>
where
    D: Read + Write,
{
    pub fn from_device(dev: D, path: String, buffer_len: usize, drop_frames: u32) -> Self {
        SerialLink {
            dev,
            path,
            read_buf: vec![0; buffer_len.max(1)],
            leading: LeadingFrameFilter::new(drop_frames),
        }
    }

    fn read_failed(&self, source: io::Error) -> TransportError {
        TransportError::ReadFailed {
            path: self.path.clone(),
            source,
        }
    }

    fn write_and_drain(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        let written = self.dev.write(frame).map_err(|source| TransportError::WriteFailed {
            path: self.path.clone(),
            source,
        })?;
        if written != frame.len() {
            return Ok(written);
        }
        match self.dev.read(&mut self.read_buf) {
            Ok(0) => Err(TransportError::EmptyResponse { path: self.path.clone() }),
            Ok(n) => {
                debug!("drained {} byte response", n);
                Ok(written)
            }
            Err(err) => Err(self.read_failed(err)),
        }
    }
}

impl<D> DiagTransport for SerialLink<D>
where
    D: Read + Write,
{
    fn name(&self) -> &str {
        &self.path
    }

    fn write(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        let result = self.write_and_drain(frame);
        // whatever the modem still says about this command isn't log data
        self.leading.rearm();
        result
    }

    fn read(&mut self) -> Result<Batch<'_>, TransportError> {
        loop {
            let bytes_read = match self.dev.read(&mut self.read_buf) {
                Ok(0) => {
                    return Err(self.read_failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Read incompletely",
                    )))
                }
                Ok(n) => n,
                Err(err) => return Err(self.read_failed(err)),
            };
            let stamp = posix_now_ns();
            match self.leading.filter(&self.read_buf[..bytes_read]) {
                Some(start) => {
                    return Ok(Batch {
                        data: &self.read_buf[start..bytes_read],
                        stamp: Some(stamp),
                    })
                }
                None => debug!("dropped {} leading bytes", bytes_read),
            }
        }
    }

    fn close(&mut self) {}
}
