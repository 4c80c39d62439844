pub mod clock;
pub mod config;
pub mod diag;
pub mod diag_reader;
pub mod error;
pub mod hdlc;
pub mod stamp;

// the stamp corrector also runs on hosts without a diag driver or termios
#[cfg(target_family = "unix")]
pub mod capture;
#[cfg(target_family = "unix")]
pub mod control;
#[cfg(target_family = "unix")]
pub mod diag_device;
#[cfg(target_family = "unix")]
pub mod negotiation;
#[cfg(target_family = "unix")]
pub mod serial;
#[cfg(target_family = "unix")]
pub mod transport;

#[cfg(all(feature = "libdiag", any(target_os = "linux", target_os = "android")))]
pub mod libdiag;
