use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

/// Where vendors install libdiag.so, 64-bit first.
pub const DEFAULT_LIBDIAG_PATHS: [&str; 2] = [
    "/system/vendor/lib64/libdiag.so",
    "/system/vendor/lib/libdiag.so",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// /dev/diag in memory device mode
    Char,
    /// a USB serial diag port
    Serial,
}

/// The structure of a valid diag-logcat configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Character device node
    pub diag_device_path: String,
    /// Serial device node
    pub serial_device_path: String,
    /// Transports to try, in order
    pub transports: Vec<TransportKind>,
    /// Size of a single device read
    pub read_buffer_size: usize,
    /// Frames thrown away after opening the serial link and after each write
    pub serial_drop_leading_frames: u32,
    /// Minimum time between anchors; 0 anchors every stamped message
    pub anchor_interval_ms: u64,
    /// Time covered by one log file pair; 0 never rotates
    pub rotate_interval_ms: u64,
    /// Where to look for the vendor's libdiag.so
    pub libdiag_paths: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            diag_device_path: "/dev/diag".to_string(),
            serial_device_path: "/dev/ttyUSB0".to_string(),
            transports: vec![TransportKind::Char, TransportKind::Serial],
            read_buffer_size: 65536,
            serial_drop_leading_frames: 3,
            anchor_interval_ms: 0,
            rotate_interval_ms: 1000,
            libdiag_paths: DEFAULT_LIBDIAG_PATHS.iter().map(|path| path.to_string()).collect(),
        }
    }
}

pub fn parse_config<P>(path: P) -> Result<CaptureConfig, toml::de::Error>
where
    P: AsRef<Path>,
{
    if let Ok(config_file) = std::fs::read_to_string(&path) {
        toml::from_str(&config_file)
    } else {
        warn!("unable to read config file {:?}, using default config", path.as_ref());
        Ok(CaptureConfig::default())
    }
}
