//! Switching logging through the vendor's own libdiag.so when every ioctl
//! layout we know of has failed.
//!
//! libdiag's `diag_switch_logging` spins up worker threads we have no use for,
//! and a library with live threads can't be unloaded. While the vendor entry
//! point runs, `pthread_create` calls are swallowed by the interposer below;
//! at any other time it forwards to the real implementation. The capture
//! binary is linked with `-rdynamic` so the library resolves to it.

use std::ffi::{c_char, c_int, c_void};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use libloading::os::unix::{Library as UnixLibrary, RTLD_NOW};
use libloading::{Library, Symbol};
use log::{error, info, warn};

use crate::config::DEFAULT_LIBDIAG_PATHS;
use crate::negotiation::{FallbackError, LoggingFallback};

static SUPPRESS_THREADS: AtomicBool = AtomicBool::new(false);

type PthreadCreate = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    extern "C" fn(*mut c_void) -> *mut c_void,
    *mut c_void,
) -> c_int;

/// Swallows thread creation for as long as it's alive. Suppression is
/// process-wide, so this is only sound while no other thread of ours is
/// spawning threads.
struct ThreadSuppression;

impl ThreadSuppression {
    fn begin() -> Self {
        SUPPRESS_THREADS.store(true, Ordering::SeqCst);
        ThreadSuppression
    }
}

impl Drop for ThreadSuppression {
    fn drop(&mut self) {
        SUPPRESS_THREADS.store(false, Ordering::SeqCst);
    }
}

fn real_pthread_create() -> Option<PthreadCreate> {
    static REAL: OnceLock<usize> = OnceLock::new();
    let addr = *REAL.get_or_init(|| {
        // SAFETY: dlsym with a nul-terminated name; RTLD_NEXT skips our own
        // definition
        unsafe { libc::dlsym(libc::RTLD_NEXT, c"pthread_create".as_ptr()) as usize }
    });
    if addr == 0 {
        None
    } else {
        // SAFETY: the symbol found is libc's pthread_create, whose signature
        // matches `PthreadCreate`
        Some(unsafe { std::mem::transmute::<usize, PthreadCreate>(addr) })
    }
}

/// # Safety
///
/// Same contract as libc's `pthread_create`.
#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: extern "C" fn(*mut c_void) -> *mut c_void,
    arg: *mut c_void,
) -> c_int {
    if SUPPRESS_THREADS.load(Ordering::SeqCst) {
        if !thread.is_null() {
            *thread = 1 as libc::pthread_t;
        }
        return 0;
    }
    match real_pthread_create() {
        Some(real) => real(thread, attr, start_routine, arg),
        None => libc::EAGAIN,
    }
}

/// The vendor library as a `LoggingFallback`, searched for in `paths`.
#[derive(Debug, Clone)]
pub struct LibDiag {
    paths: Vec<PathBuf>,
}

impl Default for LibDiag {
    fn default() -> Self {
        LibDiag::new(DEFAULT_LIBDIAG_PATHS)
    }
}

impl LibDiag {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        LibDiag {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    fn load(&self) -> Result<Library, FallbackError> {
        for path in &self.paths {
            // SAFETY: runs the vendor library's initializers, which we trust as
            // much as the driver they were shipped with
            match unsafe { UnixLibrary::open(Some(path), RTLD_NOW) } {
                Ok(lib) => {
                    info!("dlopen {} succeeded", path.display());
                    return Ok(Library::from(lib));
                }
                Err(err) => error!("dlopen {} failed ({})", path.display(), err),
            }
        }
        Err(FallbackError::LibraryNotFound(
            self.paths.iter().map(|path| path.display().to_string()).collect(),
        ))
    }
}

impl LoggingFallback for LibDiag {
    fn switch_logging(&mut self, fd: RawFd, mode: i32) -> Result<(), FallbackError> {
        let lib = self.load()?;

        // SAFETY: the symbol types follow libdiag's exported declarations:
        // `void diag_switch_logging(int, const char *)` plus the `int` globals
        // `diag_fd` (or `fd` in older builds) and `logging_mode`
        unsafe {
            let switch_logging: Symbol<unsafe extern "C" fn(c_int, *const c_char)> = lib
                .get(b"diag_switch_logging\0")
                .map_err(|_| FallbackError::MissingSymbol("diag_switch_logging"))?;
            let diag_fd: Symbol<*mut c_int> = lib
                .get(b"diag_fd\0")
                .or_else(|_| lib.get(b"fd\0"))
                .map_err(|_| FallbackError::MissingSymbol("diag_fd/fd"))?;
            let logging_mode: Option<Symbol<*mut c_int>> = lib.get(b"logging_mode\0").ok();

            // libdiag would otherwise open /dev/diag itself, which fails with
            // EEXIST since we already hold it
            **diag_fd = fd;
            {
                let _suppressed = ThreadSuppression::begin();
                switch_logging(mode, std::ptr::null());
            }

            match logging_mode {
                Some(logging_mode) if **logging_mode != mode => {
                    error!("diag_switch_logging in libdiag.so failed");
                    Err(FallbackError::ModeNotApplied {
                        expected: mode,
                        actual: **logging_mode,
                    })
                }
                Some(_) => Ok(()),
                None => {
                    warn!("Missing symbol logging_mode in libdiag.so, assuming diag_switch_logging succeeded");
                    Ok(())
                }
            }
        }
    }
}
