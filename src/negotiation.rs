//! Switching an open /dev/diag descriptor into a batch-log delivery mode.
//!
//! DIAG_IOCTL_SWITCH_LOGGING has changed its argument several times over the
//! kernel's history and there's no way to ask a driver which version it
//! speaks. Trying each layout blindly is worse than it sounds: a newer driver
//! handed an older, shorter structure may not fail at all and instead read
//! past its end. So we probe how many argument bytes the driver copies in and
//! pick the layout with exactly that size, falling back to the integer forms
//! and finally to the vendor's own library.

use std::io;
use std::os::fd::RawFd;

use deku::prelude::*;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::control::{probe_arg_len, ControlArg, DiagControl};
use crate::diag::{
    BufferingMode, ConAllParam, DciRegTable, LoggingModeParam, LoggingModeParamV7,
    LoggingModeParamV9, SwitchLoggingLayout, DCI_LOCAL_PROC, DCI_MDM_PROC, DEFAULT_HIGH_WM_VAL,
    DEFAULT_LOW_WM_VAL, DIAG_BUFFERING_MODE_STREAMING, DIAG_CON_ALL, DIAG_CON_ALL_NO_NPU,
    DIAG_IOCTL_DCI_DEINIT, DIAG_IOCTL_DCI_REG, DIAG_IOCTL_OPTIMIZED_LOGGING, DIAG_IOCTL_PERIPHERAL_BUF_CONFIG,
    DIAG_IOCTL_QUERY_CON_ALL, DIAG_IOCTL_REMOTE_DEV, DIAG_IOCTL_SWITCH_LOGGING, DIAG_MD_LOCAL,
    PERIPHERAL_MODEM,
};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("every DIAG_IOCTL_SWITCH_LOGGING path failed (probed argument length: {arg_len:?})")]
    Exhausted { arg_len: Option<usize> },
    #[error("Failed to encode control structure: {0}")]
    Encoding(#[from] DekuError),
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Couldn't load libdiag from any of {0:?}")]
    LibraryNotFound(Vec<String>),
    #[error("Missing symbol {0} in libdiag")]
    MissingSymbol(&'static str),
    #[error("libdiag left logging mode at {actual} instead of {expected}")]
    ModeNotApplied { expected: i32, actual: i32 },
}

/// A last-resort way of switching the logging mode once every ioctl layout
/// has failed, handed the already-open descriptor.
pub trait LoggingFallback {
    fn switch_logging(&mut self, fd: RawFd, mode: i32) -> Result<(), FallbackError>;
}

/// How the logging mode was eventually switched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitch {
    Structured(SwitchLoggingLayout),
    LegacyInteger { padded: bool },
    Library,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    ConfiguringBuffering,
    ProbingArgumentLength,
    SwitchingMode(Option<SwitchLoggingLayout>),
    LegacyInteger,
    LibraryFallback,
    Done(ModeSwitch),
}

/// What negotiation learned about the device. The transport keeps it for
/// framing writes and for cleanup on close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationContext {
    pub mode: i32,
    pub remote_dev: u16,
    pub dci_client: Option<i32>,
    pub arg_len: Option<usize>,
    pub switched_by: Option<ModeSwitch>,
}

pub struct Negotiator<'a, C: DiagControl + ?Sized> {
    dev: &'a mut C,
    fallback: Option<&'a mut dyn LoggingFallback>,
    ctx: NegotiationContext,
}

impl<'a, C: DiagControl + ?Sized> Negotiator<'a, C> {
    pub fn new(dev: &'a mut C, mode: i32) -> Self {
        Negotiator {
            dev,
            fallback: None,
            ctx: NegotiationContext {
                mode,
                ..Default::default()
            },
        }
    }

    pub fn with_fallback(mut self, fallback: &'a mut dyn LoggingFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Drives the negotiation to completion. On failure the DCI client
    /// registered along the way is released again.
    pub fn run(mut self) -> Result<NegotiationContext, NegotiationError> {
        match self.drive() {
            Ok(switch) => {
                self.ctx.switched_by = Some(switch);
                Ok(self.ctx)
            }
            Err(err) => {
                self.deregister_dci();
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<ModeSwitch, NegotiationError> {
        let mut state = NegotiationState::ConfiguringBuffering;
        loop {
            debug!("negotiation state: {:?}", state);
            state = match state {
                NegotiationState::ConfiguringBuffering => {
                    self.configure()?;
                    NegotiationState::ProbingArgumentLength
                }
                NegotiationState::ProbingArgumentLength => {
                    NegotiationState::SwitchingMode(self.probe_layout())
                }
                NegotiationState::SwitchingMode(Some(SwitchLoggingLayout::Legacy)) => {
                    match self.switch_integer() {
                        Some(switch) => NegotiationState::Done(switch),
                        None => NegotiationState::LibraryFallback,
                    }
                }
                NegotiationState::SwitchingMode(Some(layout)) => {
                    if self.switch_structured(layout)? {
                        NegotiationState::Done(ModeSwitch::Structured(layout))
                    } else {
                        NegotiationState::LegacyInteger
                    }
                }
                NegotiationState::SwitchingMode(None) => NegotiationState::LegacyInteger,
                NegotiationState::LegacyInteger => match self.switch_integer() {
                    Some(switch) => NegotiationState::Done(switch),
                    None => NegotiationState::LibraryFallback,
                },
                NegotiationState::LibraryFallback => {
                    let Some(fallback) = self.fallback.take() else {
                        return Err(NegotiationError::Exhausted { arg_len: self.ctx.arg_len });
                    };
                    match fallback.switch_logging(self.dev.as_raw_fd(), self.ctx.mode) {
                        Ok(()) => {
                            info!("Using libdiag.so to switch logging succeeded");
                            NegotiationState::Done(ModeSwitch::Library)
                        }
                        Err(err) => {
                            error!("libdiag.so fallback failed: {}", err);
                            return Err(NegotiationError::Exhausted { arg_len: self.ctx.arg_len });
                        }
                    }
                }
                NegotiationState::Done(switch) => return Ok(switch),
            };
        }
    }

    // Everything here is best-effort: drivers that don't know a request just
    // leave us with their defaults.
    fn configure(&mut self) -> Result<(), NegotiationError> {
        let mut remote_dev = [0u8; 2];
        self.ctx.remote_dev = match self.control(DIAG_IOCTL_REMOTE_DEV, ControlArg::Buffer(&mut remote_dev)) {
            Ok(_) => u16::from_le_bytes(remote_dev),
            Err(err) => {
                warn!("DIAG_IOCTL_REMOTE_DEV ioctl failed ({}), assuming no remote processor", err);
                0
            }
        };

        let mut dci_reg = DciRegTable {
            client_id: 0,
            notification_list: 0,
            signal_type: libc::SIGPIPE,
            token: if self.ctx.remote_dev != 0 { DCI_MDM_PROC } else { DCI_LOCAL_PROC },
        }
        .to_bytes()?;
        self.ctx.dci_client = match self.control(DIAG_IOCTL_DCI_REG, ControlArg::Buffer(&mut dci_reg)) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!("DIAG_IOCTL_DCI_REG ioctl failed ({})", err);
                None
            }
        };

        // Only the Nexus 6 kernel knows this one; everyone else rejects it.
        if let Err(err) = self.control(DIAG_IOCTL_OPTIMIZED_LOGGING, ControlArg::Value(1)) {
            debug!("optimized logging not supported ({})", err);
        }

        let mut buffering_mode = BufferingMode {
            peripheral: PERIPHERAL_MODEM,
            mode: DIAG_BUFFERING_MODE_STREAMING,
            high_wm_val: DEFAULT_HIGH_WM_VAL,
            low_wm_val: DEFAULT_LOW_WM_VAL,
        }
        .to_bytes()?;
        if let Err(err) = self.control(DIAG_IOCTL_PERIPHERAL_BUF_CONFIG, ControlArg::Buffer(&mut buffering_mode)) {
            warn!("DIAG_IOCTL_PERIPHERAL_BUF_CONFIG ioctl failed ({})", err);
        }
        Ok(())
    }

    fn deregister_dci(&mut self) {
        if let Some(client) = self.ctx.dci_client.take() {
            let mut client = client.to_le_bytes();
            if let Err(err) = self.control(DIAG_IOCTL_DCI_DEINIT, ControlArg::Buffer(&mut client)) {
                warn!("DIAG_IOCTL_DCI_DEINIT ioctl failed ({})", err);
            }
        }
    }

    fn probe_layout(&mut self) -> Option<SwitchLoggingLayout> {
        match probe_arg_len(&mut *self.dev, DIAG_IOCTL_SWITCH_LOGGING, SwitchLoggingLayout::MAX_ARG_LEN) {
            Ok(arg_len) => {
                self.ctx.arg_len = Some(arg_len);
                let layout = SwitchLoggingLayout::from_arg_len(arg_len);
                match layout {
                    Some(layout) => debug!("arglen={} selects {:?}", arg_len, layout),
                    None => warn!("ioctl DIAG_IOCTL_SWITCH_LOGGING with arglen={} is not supported", arg_len),
                }
                layout
            }
            Err(err) => {
                warn!("couldn't probe DIAG_IOCTL_SWITCH_LOGGING argument length ({})", err);
                None
            }
        }
    }

    fn switch_structured(&mut self, layout: SwitchLoggingLayout) -> Result<bool, NegotiationError> {
        let mode = self.ctx.mode;
        let mut arg = match layout {
            SwitchLoggingLayout::Android10 => LoggingModeParam {
                req_mode: mode as u32,
                peripheral_mask: self.query_peripheral_mask()?,
                pd_mask: 0,
                mode_param: 1,
                diag_id: 0,
                pd_val: 0,
                reserved: 0,
                // what libdiag.so sends
                peripheral: -22,
                device_mask: (1 << DIAG_MD_LOCAL) | (i32::from(self.ctx.remote_dev & 0x3ff) << 1),
            }
            .to_bytes()?,
            SwitchLoggingLayout::Android9 => LoggingModeParamV9 {
                req_mode: mode as u32,
                peripheral_mask: DIAG_CON_ALL,
                ..Default::default()
            }
            .to_bytes()?,
            SwitchLoggingLayout::Android7 => LoggingModeParamV7 {
                req_mode: mode as u32,
                peripheral_mask: DIAG_CON_ALL,
                mode_param: 0,
            }
            .to_bytes()?,
            SwitchLoggingLayout::Android6 | SwitchLoggingLayout::Legacy => mode.to_le_bytes().to_vec(),
        };

        let mut result = self.control(DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Buffer(&mut arg));
        if result.is_err() && layout == SwitchLoggingLayout::Android6 {
            result = self.dev.control_padded(DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Buffer(&mut arg));
        }

        match result {
            Ok(_) => {
                info!("ioctl DIAG_IOCTL_SWITCH_LOGGING with arglen={} succeeded", layout.arg_len());
                Ok(true)
            }
            Err(err) => {
                error!(
                    "ioctl DIAG_IOCTL_SWITCH_LOGGING with arglen={} is supported, but it failed ({})",
                    layout.arg_len(),
                    err
                );
                Ok(false)
            }
        }
    }

    fn query_peripheral_mask(&mut self) -> Result<u32, NegotiationError> {
        let mut con_all = ConAllParam {
            diag_con_all: DIAG_CON_ALL,
            ..Default::default()
        }
        .to_bytes()?;
        match self.control(DIAG_IOCTL_QUERY_CON_ALL, ControlArg::Buffer(&mut con_all)) {
            Ok(0) => Ok(ConAllParam::from_bytes((&con_all, 0))
                .map(|(_, param)| param.diag_con_all)
                .unwrap_or(DIAG_CON_ALL_NO_NPU)),
            Ok(ret) => {
                debug!("DIAG_IOCTL_QUERY_CON_ALL returned {}", ret);
                Ok(DIAG_CON_ALL_NO_NPU)
            }
            Err(err) => {
                debug!("DIAG_IOCTL_QUERY_CON_ALL ioctl failed ({})", err);
                Ok(DIAG_CON_ALL_NO_NPU)
            }
        }
    }

    fn switch_integer(&mut self) -> Option<ModeSwitch> {
        let mode = libc::c_long::from(self.ctx.mode);
        if self.control(DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Value(mode)).is_ok() {
            info!("integer DIAG_IOCTL_SWITCH_LOGGING succeeded");
            return Some(ModeSwitch::LegacyInteger { padded: false });
        }
        match self.dev.control_padded(DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Value(mode)) {
            Ok(_) => {
                info!("padded integer DIAG_IOCTL_SWITCH_LOGGING succeeded");
                Some(ModeSwitch::LegacyInteger { padded: true })
            }
            Err(err) => {
                warn!("integer DIAG_IOCTL_SWITCH_LOGGING failed ({})", err);
                None
            }
        }
    }

    fn control(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
        self.dev.control(request, arg)
    }
}

/// Runs the whole negotiation on `dev`, switching it into `mode`.
pub fn negotiate<C>(
    dev: &mut C,
    mode: i32,
    fallback: Option<&mut dyn LoggingFallback>,
) -> Result<NegotiationContext, NegotiationError>
where
    C: DiagControl + ?Sized,
{
    let negotiator = Negotiator::new(dev, mode);
    match fallback {
        Some(fallback) => negotiator.with_fallback(fallback).run(),
        None => negotiator.run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{NO_FD, PROBE_FILL};
    use crate::diag::MEMORY_DEVICE_MODE;
    use std::os::fd::AsRawFd;

    /// A driver that copies in exactly `switch_arg_len` bytes for
    /// DIAG_IOCTL_SWITCH_LOGGING and records everything it's handed.
    #[derive(Default)]
    struct SimulatedDiag {
        switch_arg_len: Option<usize>,
        accept_value_switch: bool,
        reject_real_struct: bool,
        remote_dev: Option<u16>,
        con_all: Option<u32>,
        switch_calls: Vec<Vec<u8>>,
        value_calls: Vec<(libc::c_long, bool)>,
        buffering: Option<Vec<u8>>,
        dci_reg: Option<Vec<u8>>,
        dci_deinits: Vec<i32>,
    }

    impl SimulatedDiag {
        fn accepting(len: usize) -> Self {
            SimulatedDiag {
                switch_arg_len: Some(len),
                ..Default::default()
            }
        }

        fn handle(&mut self, request: u32, arg: ControlArg<'_>, padded: bool) -> io::Result<libc::c_int> {
            let err = |code| Err(io::Error::from_raw_os_error(code));
            match (request, arg) {
                (DIAG_IOCTL_REMOTE_DEV, ControlArg::Buffer(buf)) => match self.remote_dev {
                    Some(id) => {
                        buf.copy_from_slice(&id.to_le_bytes());
                        Ok(0)
                    }
                    None => err(libc::EINVAL),
                },
                (DIAG_IOCTL_DCI_REG, ControlArg::Buffer(buf)) => {
                    self.dci_reg = Some(buf.to_vec());
                    Ok(5)
                }
                (DIAG_IOCTL_DCI_DEINIT, ControlArg::Buffer(buf)) => {
                    self.dci_deinits.push(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
                    Ok(0)
                }
                (DIAG_IOCTL_PERIPHERAL_BUF_CONFIG, ControlArg::Buffer(buf)) => {
                    self.buffering = Some(buf.to_vec());
                    Ok(0)
                }
                (DIAG_IOCTL_OPTIMIZED_LOGGING, ControlArg::Value(_)) => err(libc::EFAULT),
                (DIAG_IOCTL_QUERY_CON_ALL, ControlArg::Buffer(buf)) => match self.con_all {
                    Some(mask) => {
                        buf[..4].copy_from_slice(&mask.to_le_bytes());
                        Ok(0)
                    }
                    None => err(libc::EINVAL),
                },
                (DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Buffer(buf)) => match self.switch_arg_len {
                    Some(needed) if buf.len() < needed => err(libc::EFAULT),
                    Some(_) if self.reject_real_struct && buf.first() != Some(&PROBE_FILL) => err(libc::EINVAL),
                    Some(_) => {
                        self.switch_calls.push(buf.to_vec());
                        Ok(0)
                    }
                    None => err(libc::EINVAL),
                },
                (DIAG_IOCTL_SWITCH_LOGGING, ControlArg::Value(value)) => {
                    if self.accept_value_switch {
                        self.value_calls.push((value, padded));
                        Ok(0)
                    } else {
                        err(libc::EINVAL)
                    }
                }
                _ => err(libc::ENOTTY),
            }
        }
    }

    impl AsRawFd for SimulatedDiag {
        fn as_raw_fd(&self) -> RawFd {
            NO_FD
        }
    }

    impl DiagControl for SimulatedDiag {
        fn control(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
            self.handle(request, arg, false)
        }

        fn control_padded(&mut self, request: u32, arg: ControlArg<'_>) -> io::Result<libc::c_int> {
            self.handle(request, arg, true)
        }
    }

    struct RecordingFallback {
        succeed: bool,
        calls: Vec<(RawFd, i32)>,
    }

    impl LoggingFallback for RecordingFallback {
        fn switch_logging(&mut self, fd: RawFd, mode: i32) -> Result<(), FallbackError> {
            self.calls.push((fd, mode));
            if self.succeed {
                Ok(())
            } else {
                Err(FallbackError::ModeNotApplied { expected: mode, actual: 0 })
            }
        }
    }

    #[test]
    fn test_android7_layout_without_library_fallback() {
        let mut dev = SimulatedDiag::accepting(SwitchLoggingLayout::Android7.arg_len());
        let mut fallback = RecordingFallback { succeed: true, calls: Vec::new() };
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, Some(&mut fallback)).unwrap();

        assert_eq!(ctx.arg_len, Some(9));
        assert_eq!(ctx.switched_by, Some(ModeSwitch::Structured(SwitchLoggingLayout::Android7)));
        assert!(fallback.calls.is_empty());
        assert!(dev.dci_deinits.is_empty());
        // the probe call that got through, then the real one
        assert_eq!(dev.switch_calls.len(), 2);
        assert_eq!(dev.switch_calls[0], vec![PROBE_FILL; 9]);
        assert_eq!(dev.switch_calls[1], vec![2, 0, 0, 0, 0xff, 0, 0, 0, 0]);
    }

    #[test]
    fn test_android10_layout_uses_queried_mask() {
        let mut dev = SimulatedDiag {
            remote_dev: Some(1),
            con_all: Some(0x3f),
            ..SimulatedDiag::accepting(24)
        };
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();

        assert_eq!(ctx.remote_dev, 1);
        assert_eq!(ctx.dci_client, Some(5));
        assert_eq!(ctx.switched_by, Some(ModeSwitch::Structured(SwitchLoggingLayout::Android10)));
        let (_, param) = LoggingModeParam::from_bytes((dev.switch_calls.last().unwrap(), 0)).unwrap();
        assert_eq!(param, LoggingModeParam {
            req_mode: 2,
            peripheral_mask: 0x3f,
            pd_mask: 0,
            mode_param: 1,
            diag_id: 0,
            pd_val: 0,
            reserved: 0,
            peripheral: -22,
            device_mask: 3,
        });

        let (_, dci_reg) = DciRegTable::from_bytes((dev.dci_reg.as_ref().unwrap(), 0)).unwrap();
        assert_eq!(dci_reg.token, DCI_MDM_PROC);
        assert_eq!(dci_reg.signal_type, libc::SIGPIPE);
    }

    #[test]
    fn test_android10_layout_default_mask() {
        let mut dev = SimulatedDiag::accepting(24);
        negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();
        let (_, param) = LoggingModeParam::from_bytes((dev.switch_calls.last().unwrap(), 0)).unwrap();
        assert_eq!(param.peripheral_mask, DIAG_CON_ALL_NO_NPU);
        assert_eq!(param.device_mask, 1);
    }

    #[test]
    fn test_android9_layout() {
        let mut dev = SimulatedDiag::accepting(20);
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();
        assert_eq!(ctx.switched_by, Some(ModeSwitch::Structured(SwitchLoggingLayout::Android9)));
        let (_, param) = LoggingModeParamV9::from_bytes((dev.switch_calls.last().unwrap(), 0)).unwrap();
        assert_eq!(param, LoggingModeParamV9 {
            req_mode: 2,
            peripheral_mask: DIAG_CON_ALL,
            ..Default::default()
        });
    }

    #[test]
    fn test_android6_layout() {
        let mut dev = SimulatedDiag::accepting(4);
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();
        assert_eq!(ctx.switched_by, Some(ModeSwitch::Structured(SwitchLoggingLayout::Android6)));
        assert_eq!(dev.switch_calls.last().unwrap(), &vec![2, 0, 0, 0]);
    }

    #[test]
    fn test_legacy_layout_passes_mode_by_value() {
        let mut dev = SimulatedDiag {
            accept_value_switch: true,
            ..SimulatedDiag::accepting(0)
        };
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();
        assert_eq!(ctx.arg_len, Some(0));
        assert_eq!(ctx.switched_by, Some(ModeSwitch::LegacyInteger { padded: false }));
        assert_eq!(dev.value_calls, vec![(2, false)]);
    }

    #[test]
    fn test_failed_structure_falls_back_to_integer() {
        let mut dev = SimulatedDiag {
            accept_value_switch: true,
            reject_real_struct: true,
            ..SimulatedDiag::accepting(20)
        };
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();
        assert_eq!(ctx.switched_by, Some(ModeSwitch::LegacyInteger { padded: false }));
    }

    #[test]
    fn test_library_fallback_when_everything_fails() {
        let mut dev = SimulatedDiag::default();
        let mut fallback = RecordingFallback { succeed: true, calls: Vec::new() };
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, Some(&mut fallback)).unwrap();
        assert_eq!(ctx.switched_by, Some(ModeSwitch::Library));
        assert_eq!(fallback.calls, vec![(NO_FD, MEMORY_DEVICE_MODE)]);
    }

    #[test]
    fn test_exhausted() {
        let mut dev = SimulatedDiag::default();
        assert!(matches!(
            negotiate(&mut dev, MEMORY_DEVICE_MODE, None),
            Err(NegotiationError::Exhausted { arg_len: Some(0) })
        ));
        // the DCI client registered while configuring is handed back
        assert_eq!(dev.dci_deinits, vec![5]);

        let mut dev = SimulatedDiag::default();
        let mut fallback = RecordingFallback { succeed: false, calls: Vec::new() };
        assert!(matches!(
            negotiate(&mut dev, MEMORY_DEVICE_MODE, Some(&mut fallback)),
            Err(NegotiationError::Exhausted { .. })
        ));
        assert_eq!(fallback.calls.len(), 1);
        assert_eq!(dev.dci_deinits, vec![5]);
    }

    #[test]
    fn test_configuration_failures_are_not_fatal() {
        let mut dev = SimulatedDiag::accepting(9);
        let ctx = negotiate(&mut dev, MEMORY_DEVICE_MODE, None).unwrap();
        assert_eq!(ctx.remote_dev, 0);
        assert_eq!(dev.buffering, Some(vec![PERIPHERAL_MODEM, DIAG_BUFFERING_MODE_STREAMING, 85, 15]));
        let (_, dci_reg) = DciRegTable::from_bytes((dev.dci_reg.as_ref().unwrap(), 0)).unwrap();
        assert_eq!(dci_reg.token, DCI_LOCAL_PROC);
    }
}
