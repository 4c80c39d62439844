//! Device control calls on an open diag descriptor.
//!
//! `DiagControl` is the single seam between negotiation and the kernel: the
//! real implementation issues `ioctl(2)` on a `File`, and tests plug in
//! simulated drivers. `GuardPage` and `probe_arg_len` hold the only unsafe
//! memory tricks in the crate.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;

use log::debug;

/// Byte the probe scratch area is filled with. It has to decode into
/// something the driver won't choke on if a probe call happens to succeed.
pub const PROBE_FILL: u8 = 0x3f;

/// The third argument of an ioctl call.
#[derive(Debug)]
pub enum ControlArg<'a> {
    /// Pointer to a caller-owned buffer the driver may read and write.
    Buffer(&'a mut [u8]),
    /// An integer passed by value where older drivers expect it.
    Value(libc::c_long),
}

pub trait DiagControl: AsRawFd {
    /// Issues one control request. A negative return from the driver becomes
    /// the corresponding `io::Error`; otherwise the driver's return value is
    /// passed through.
    fn control(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int>;

    /// Same as `control`, but followed by the trailing zero arguments some
    /// vendor libraries pass (`12, 0, 0, 0, 0`). The kernel ignores them, but
    /// a few drivers have only ever been seen accepting the padded form.
    fn control_padded(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
        self.control(request, arg)
    }
}

fn arg_ptr(arg: ControlArg<'_>) -> *mut libc::c_void {
    match arg {
        ControlArg::Buffer(buf) => buf.as_mut_ptr() as *mut libc::c_void,
        ControlArg::Value(value) => value as *mut libc::c_void,
    }
}

fn check_ret(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

impl DiagControl for File {
    fn control(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
        let ptr = arg_ptr(arg);
        // SAFETY: `ptr` is either an integer the driver never dereferences or
        // points into a buffer borrowed for the duration of the call.
        let ret = unsafe { libc::ioctl(self.as_raw_fd(), request as libc::Ioctl, ptr) };
        check_ret(ret)
    }

    fn control_padded(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
        let ptr = arg_ptr(arg);
        let zero: libc::c_long = 0;
        // SAFETY: as above; the trailing integers are never dereferenced
        let ret = unsafe {
            libc::ioctl(
                self.as_raw_fd(),
                request as libc::Ioctl,
                ptr,
                12 as libc::c_long,
                zero,
                zero,
                zero,
                zero,
            )
        };
        check_ret(ret)
    }
}

/// One readable page immediately followed by an unmapped one.
///
/// A slice returned by `tail(len)` ends exactly at the page boundary, so a
/// driver that copies more than `len` bytes from it faults and the ioctl fails
/// with `EFAULT` instead of silently reading stale memory.
pub struct GuardPage {
    base: NonNull<u8>,
    page_size: usize,
}

impl GuardPage {
    pub fn new() -> io::Result<Self> {
        // SAFETY: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(io::Error::last_os_error());
        }
        let page_size = page_size as usize;

        // SAFETY: fresh anonymous private mapping, no existing memory touched
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the second page belongs to the mapping we just created
        let ret = unsafe { libc::munmap((base as *mut u8).add(page_size) as *mut libc::c_void, page_size) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: releasing our own mapping
            unsafe { libc::munmap(base, page_size * 2) };
            return Err(err);
        }

        let base = NonNull::new(base as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(GuardPage { base, page_size })
    }

    pub fn len(&self) -> usize {
        self.page_size
    }

    pub fn is_empty(&self) -> bool {
        self.page_size == 0
    }

    /// The last `len` bytes of the mapped page.
    pub fn tail(&mut self, len: usize) -> &mut [u8] {
        assert!(len <= self.page_size, "tail longer than the guard page");
        // SAFETY: [base + page_size - len, base + page_size) lies inside the
        // mapped page, which lives as long as `self`; `&mut self` keeps the
        // slice unique
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(self.page_size - len), len)
        }
    }
}

impl Drop for GuardPage {
    fn drop(&mut self) {
        // SAFETY: unmapping the page mapped in `new`
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.page_size) };
    }
}

/// Finds how many argument bytes `request` copies in from user space.
///
/// Calls `request` with the last `len` bytes of a guard page for `len` from 0
/// up to `max_len` and returns the first length that doesn't fail with
/// `EFAULT`. If every length faults, `max_len + 1` is returned, which matches
/// no known layout.
///
/// This is a heuristic. It assumes the argument size is fixed, that a short
/// argument is the only thing that makes the driver return `EFAULT`, and that
/// a call which does go through with `PROBE_FILL` bytes does no lasting harm.
/// None of that can be checked against unknown future drivers.
pub fn probe_arg_len<C>(dev: &mut C, request: u32, max_len: usize) -> io::Result<usize>
where
    C: DiagControl + ?Sized,
{
    let mut page = GuardPage::new()?;
    if max_len > page.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("probe length {} exceeds the page size {}", max_len, page.len()),
        ));
    }
    page.tail(max_len).fill(PROBE_FILL);

    for len in 0..=max_len {
        match dev.control(request, ControlArg::Buffer(page.tail(len))) {
            Ok(_) => return Ok(len),
            Err(err) if err.raw_os_error() == Some(libc::EFAULT) => continue,
            Err(err) => {
                debug!("probe of ioctl {} stopped at {} bytes: {}", request, len, err);
                return Ok(len);
            }
        }
    }
    Ok(max_len + 1)
}

/// Descriptor-less stand-in used by simulated drivers.
pub const NO_FD: RawFd = -1;
