use crate::clock::posix_now_ns;
use crate::control::{ControlArg, DiagControl};
use crate::diag::{DataType, RequestContainer, DIAG_IOCTL_DCI_DEINIT, MDM, MEMORY_DEVICE_MODE};
use crate::diag_reader::{BatchDemux, DemuxError};
use crate::negotiation::{negotiate, LoggingFallback, NegotiationContext};
use crate::transport::{Batch, DiagTransport, TransportError};

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use deku::prelude::*;
use log::{debug, info, warn};

pub type DiagResult<T> = Result<T, TransportError>;

/// Reads shorter than this are reported as incomplete.
const MIN_READ_LEN: usize = 5;

/// /dev/diag switched into memory device mode.
pub struct DiagDevice<D: DiagControl = File> {
    dev: D,
    path: String,
    ctx: NegotiationContext,
    read_buf: Vec<u8>,
    filled: usize,
    demux: BatchDemux,
    closed: bool,
}

impl DiagDevice<File> {
    pub fn open<P>(path: P, buffer_len: usize, fallback: Option<&mut dyn LoggingFallback>) -> DiagResult<Self>
    where
        P: AsRef<Path>,
    {
        let path_str = path.as_ref().display().to_string();
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| TransportError::OpenFailed { path: path_str.clone(), source })?;
        DiagDevice::with_device(file, path_str, buffer_len, fallback)
    }
}

impl<D> DiagDevice<D>
where
    D: DiagControl + Read + Write,
{
    /// Negotiates memory device mode on an already open device.
    pub fn with_device(
        mut dev: D,
        path: String,
        buffer_len: usize,
        fallback: Option<&mut dyn LoggingFallback>,
    ) -> DiagResult<Self> {
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, fallback)
            .map_err(|source| TransportError::NegotiationFailed { path: path.clone(), source })?;
        info!(
            "{} in memory device mode via {:?} (remote_dev={}, dci_client={:?})",
            path, ctx.switched_by, ctx.remote_dev, ctx.dci_client
        );

        Ok(DiagDevice {
            dev,
            path,
            ctx,
            read_buf: vec![0; buffer_len.max(MIN_READ_LEN)],
            filled: 0,
            demux: BatchDemux::new(),
            closed: false,
        })
    }

    pub fn context(&self) -> &NegotiationContext {
        &self.ctx
    }

    fn read_failed(&self, source: io::Error) -> TransportError {
        TransportError::ReadFailed { path: self.path.clone(), source }
    }

    // Reads batches until one holds user-space messages.
    fn fill(&mut self) -> DiagResult<()> {
        while self.demux.is_exhausted() {
            let bytes_read = match self.dev.read(&mut self.read_buf) {
                Ok(n) if n >= MIN_READ_LEN => n,
                Ok(_) => {
                    self.demux.reset();
                    return Err(self.read_failed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Read incompletely",
                    )));
                }
                Err(err) => {
                    self.demux.reset();
                    return Err(self.read_failed(err));
                }
            };
            self.filled = bytes_read;
            let loaded = self
                .demux
                .load(&self.read_buf[..bytes_read], posix_now_ns())
                .map_err(|source| TransportError::MalformedBatch { path: self.path.clone(), source })?;
            if !loaded {
                debug!("skipping non-userspace batch of {} bytes", bytes_read);
            }
        }
        Ok(())
    }
}

impl<D> DiagTransport for DiagDevice<D>
where
    D: DiagControl + Read + Write,
{
    fn name(&self) -> &str {
        &self.path
    }

    fn write(&mut self, frame: &[u8]) -> DiagResult<usize> {
        self.demux.reset();
        let buf = RequestContainer {
            data_type: DataType::UserSpace,
            use_mdm: self.ctx.remote_dev != 0,
            mdm_field: -MDM,
            hdlc_encapsulated_request: frame.to_vec(),
        }
        .to_bytes()?;

        // some drivers report 0 bytes for a write they did take
        let written = self
            .dev
            .write(&buf)
            .map_err(|source| TransportError::WriteFailed { path: self.path.clone(), source })?;
        debug!("wrote {} byte request ({} reported)", buf.len(), written);

        // Every command has to be followed by reading its response: it keeps
        // the next command from blocking and keeps responses out of the log.
        match self.dev.read(&mut self.read_buf) {
            Ok(0) => Err(TransportError::EmptyResponse { path: self.path.clone() }),
            Ok(n) => {
                debug!("drained {} byte response", n);
                Ok(frame.len())
            }
            Err(err) => Err(self.read_failed(err)),
        }
    }

    fn read(&mut self) -> DiagResult<Batch<'_>> {
        self.fill()?;
        let batch = &self.read_buf[..self.filled];
        let message = self
            .demux
            .next_message(batch)
            .unwrap_or(Err(DemuxError::NoMessage))
            .map_err(|source| TransportError::MalformedBatch { path: self.path.clone(), source })?;
        Ok(Batch {
            data: message.data,
            stamp: message.stamp,
        })
    }

    fn close(&mut self) {
        self.release();
    }
}

impl<D: DiagControl> DiagDevice<D> {
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(client) = self.ctx.dci_client {
            let mut client = client.to_le_bytes();
            if let Err(err) = self.dev.control(DIAG_IOCTL_DCI_DEINIT, ControlArg::Buffer(&mut client)) {
                warn!("DIAG_IOCTL_DCI_DEINIT ioctl failed ({})", err);
            }
        }
    }
}

impl<D: DiagControl> Drop for DiagDevice<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::NO_FD;
    use crate::diag::{DIAG_IOCTL_DCI_REG, DIAG_IOCTL_REMOTE_DEV, DIAG_IOCTL_SWITCH_LOGGING};
    use crate::hdlc::hdlc_encapsulate;
    use std::collections::VecDeque;
    use std::os::fd::{AsRawFd, RawFd};

    /// Accepts the Android 7 logging layout and plays back canned reads.
    #[derive(Default)]
    struct FakeDiag {
        remote_dev: u16,
        reads: VecDeque<io::Result<Vec<u8>>>,
        writes: Vec<Vec<u8>>,
        deinits: Vec<i32>,
    }

    impl AsRawFd for FakeDiag {
        fn as_raw_fd(&self) -> RawFd {
            NO_FD
        }
    }

    impl DiagControl for FakeDiag {
        fn control(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
            match (request, arg) {
                (DIAG_IOCTL_REMOTE_DEV, ControlArg::Buffer(buf)) => {
                    buf.copy_from_slice(&self.remote_dev.to_le_bytes());
                    Ok(0)
                }
                (DIAG_IOCTL_DCI_REG, ControlArg::Buffer(_)) => Ok(3),
                (DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Buffer(buf)) if buf.len() >= 9 => Ok(0),
                (DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Buffer(_)) => Err(io::Error::from_raw_os_error(libc::EFAULT)),
                (DIAG_IOCTL_DCI_DEINIT, ControlArg::Buffer(buf)) => {
                    self.deinits.push(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
                    Ok(0)
                }
                _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            }
        }
    }

    impl Read for FakeDiag {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(err)) => Err(err),
                None => Ok(0),
            }
        }
    }

    impl Write for FakeDiag {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.push(buf.to_vec());
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn user_space_batch(data_type: u32, payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = data_type.to_le_bytes().to_vec();
        buf.extend((payloads.len() as u32).to_le_bytes());
        for payload in payloads {
            buf.extend((payload.len() as i32).to_le_bytes());
            buf.extend(*payload);
        }
        buf
    }

    fn open(fake: FakeDiag) -> DiagDevice<FakeDiag> {
        DiagDevice::with_device(fake, "/dev/diag".to_string(), 65536, None).unwrap()
    }

    #[test]
    fn test_write_wraps_and_drains() {
        let mut fake = FakeDiag::default();
        fake.reads.push_back(Ok(vec![0x20, 0, 0, 0, 1, 0, 0, 0]));
        let mut dev = open(fake);
        assert_eq!(dev.context().dci_client, Some(3));

        let frame = hdlc_encapsulate(&[0x1d]);
        assert_eq!(dev.write(&frame).unwrap(), frame.len());
        let mut expected = vec![0x20, 0, 0, 0];
        expected.extend(&frame);
        assert_eq!(dev.dev.writes, vec![expected]);
        assert!(dev.dev.reads.is_empty());
    }

    #[test]
    fn test_write_with_remote_processor() {
        let fake = FakeDiag {
            remote_dev: 1,
            reads: VecDeque::from([Ok(vec![1])]),
            ..Default::default()
        };
        let mut dev = open(fake);
        dev.write(&[0x01, 0x02, 0x7e]).unwrap();
        assert_eq!(dev.dev.writes[0], vec![0x20, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0x01, 0x02, 0x7e]);
    }

    #[test]
    fn test_empty_response() {
        let mut dev = open(FakeDiag::default());
        assert!(matches!(dev.write(&[0x01, 0x02, 0x7e]), Err(TransportError::EmptyResponse { .. })));
    }

    #[test]
    fn test_read_demultiplexes() {
        let fake = FakeDiag {
            reads: VecDeque::from([
                Ok(user_space_batch(0x02, &[&[9, 9]])),
                Ok(user_space_batch(0x20, &[&[1, 2], &[3]])),
            ]),
            ..Default::default()
        };
        let mut dev = open(fake);

        let first = dev.read().unwrap();
        assert_eq!(first.data, &[1, 2]);
        assert_eq!(first.stamp, None);
        let second = dev.read().unwrap();
        assert_eq!(second.data, &[3]);
        assert!(second.stamp.is_some());
    }

    #[test]
    fn test_short_control_packet_is_skipped() {
        let fake = FakeDiag {
            reads: VecDeque::from([
                Ok(vec![0x02, 0, 0, 0, 0, 0]),
                Ok(user_space_batch(0x20, &[&[7]])),
            ]),
            ..Default::default()
        };
        let mut dev = open(fake);
        let batch = dev.read().unwrap();
        assert_eq!(batch.data, &[7]);
        assert!(batch.stamp.is_some());
    }

    #[test]
    fn test_incomplete_read_resets() {
        let fake = FakeDiag {
            reads: VecDeque::from([
                Ok(user_space_batch(0x20, &[&[1], &[2]])),
                Ok(vec![0x20, 0, 0, 0]),
                Ok(user_space_batch(0x20, &[&[5]])),
            ]),
            ..Default::default()
        };
        let mut dev = open(fake);
        assert_eq!(dev.read().unwrap().data, &[1]);
        assert_eq!(dev.read().unwrap().data, &[2]);
        assert!(matches!(dev.read(), Err(TransportError::ReadFailed { .. })));
        // the handle stays usable
        assert_eq!(dev.read().unwrap().data, &[5]);
    }

    #[test]
    fn test_close_deinits_once() {
        let mut dev = open(FakeDiag::default());
        dev.close();
        dev.close();
        assert_eq!(dev.dev.deinits, vec![3]);
    }

    #[test]
    fn test_negotiation_failure() {
        struct Rejects(FakeDiag);
        impl AsRawFd for Rejects {
            fn as_raw_fd(&self) -> RawFd {
                NO_FD
            }
        }
        impl DiagControl for Rejects {
            fn control(&mut self, _request: u32, _arg: ControlArg<'_>) -> io::Result<libc::c_int> {
                Err(io::Error::from_raw_os_error(libc::EINVAL))
            }
        }
        impl Read for Rejects {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(buf)
            }
        }
        impl Write for Rejects {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let result = DiagDevice::with_device(Rejects(FakeDiag::default()), "/dev/diag".to_string(), 64, None);
        assert!(matches!(result, Err(TransportError::NegotiationFailed { .. })));
    }

    #[test]
    fn test_open_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            DiagDevice::open(dir.path().join("diag"), 64, None),
            Err(TransportError::OpenFailed { .. })
        ));
    }
}
