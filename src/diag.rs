//! The /dev/diag driver ABI: ioctl request numbers, buffer data types and the
//! control structures the various kernel generations expect.
//!
//! Structure layouts are taken from the msm kernel's diagchar.h across
//! several Android releases. They are packed, so every structure here is
//! serialized with deku rather than passed as a `#[repr(C)]` value; tests pin
//! their encoded sizes to the sizes the drivers check for.

use deku::prelude::*;

// Logging modes
pub const MEMORY_DEVICE_MODE: i32 = 2;

// ioctl requests
pub const DIAG_IOCTL_SWITCH_LOGGING: u32 = 7;
pub const DIAG_IOCTL_DCI_DEINIT: u32 = 21;
pub const DIAG_IOCTL_DCI_REG: u32 = 23;
pub const DIAG_IOCTL_REMOTE_DEV: u32 = 32;
pub const DIAG_IOCTL_PERIPHERAL_BUF_CONFIG: u32 = 35;
pub const DIAG_IOCTL_QUERY_CON_ALL: u32 = 40;

// Motorola's Nexus 6 kernel reused request 35 for its own logging
// optimization switch; everywhere else that number is PERIPHERAL_BUF_CONFIG.
pub const DIAG_IOCTL_OPTIMIZED_LOGGING: u32 = 35;

// Peripheral masks
pub const DIAG_CON_ALL: u32 = 0xff;
/// Mask used when the driver can't be asked for its own (pre-NPU kernels).
pub const DIAG_CON_ALL_NO_NPU: u32 = 0x7f;

pub const DIAG_BUFFERING_MODE_STREAMING: u8 = 0;
pub const DEFAULT_LOW_WM_VAL: u8 = 15;
pub const DEFAULT_HIGH_WM_VAL: u8 = 85;
pub const PERIPHERAL_MODEM: u8 = 0;

pub const DIAG_MD_LOCAL: i32 = 0;
pub const DCI_LOCAL_PROC: i32 = 0;
pub const DCI_MDM_PROC: i32 = 1;

/// Remote processor id of the first external modem
pub const MDM: i32 = 1;

/// Buffer data type, the first u32 of every read and write.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(id_type = "u32", endian = "little")]
pub enum DataType {
    #[deku(id = "0x20")]
    UserSpace,
    #[deku(id_pat = "_")]
    Other(u32),
}

/// Prefix of every user-space write. When the device has a remote processor
/// an extra i32 (-MDM) selects which processor the command is meant for.
#[derive(Debug, Clone, DekuWrite)]
pub struct RequestContainer {
    pub data_type: DataType,
    #[deku(skip)]
    pub use_mdm: bool,
    #[deku(skip, cond = "!*use_mdm", endian = "little")]
    pub mdm_field: i32,
    pub hdlc_encapsulated_request: Vec<u8>,
}

/// The first 8 bytes of every buffer read from the device.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
pub struct BatchHeader {
    pub data_type: DataType,
    #[deku(endian = "little")]
    pub num_messages: u32,
}

impl BatchHeader {
    pub const LEN: usize = 8;
}

#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct BufferingMode {
    pub peripheral: u8,
    pub mode: u8,
    pub high_wm_val: u8,
    pub low_wm_val: u8,
}

/// Argument of DIAG_IOCTL_DCI_REG. The ioctl's return value is the client id.
#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DciRegTable {
    pub client_id: i32,
    pub notification_list: u16,
    pub signal_type: i32,
    pub token: i32,
}

#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ConAllParam {
    pub diag_con_all: u32,
    pub num_peripherals: u32,
    pub upd_map_supported: u32,
}

/// diag_logging_mode_param_t as of Android 10
#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct LoggingModeParam {
    pub req_mode: u32,
    pub peripheral_mask: u32,
    pub pd_mask: u32,
    pub mode_param: u8,
    pub diag_id: u8,
    pub pd_val: u8,
    pub reserved: u8,
    pub peripheral: i32,
    pub device_mask: i32,
}

/// diag_logging_mode_param_t as of Android 9
#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct LoggingModeParamV9 {
    pub req_mode: u32,
    pub peripheral_mask: u32,
    pub pd_mask: u32,
    pub mode_param: u8,
    pub diag_id: u8,
    pub pd_val: u8,
    pub reserved: u8,
    pub peripheral: i32,
}

/// diag_logging_mode_param_t as of Android 7
#[derive(Debug, Clone, Default, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct LoggingModeParamV7 {
    pub req_mode: u32,
    pub peripheral_mask: u32,
    pub mode_param: u8,
}

/// The historical argument layouts of DIAG_IOCTL_SWITCH_LOGGING. There's no
/// version query, so the layout is inferred from how many argument bytes the
/// driver copies in (see `control::probe_arg_len`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchLoggingLayout {
    /// `LoggingModeParam`
    Android10,
    /// `LoggingModeParamV9`
    Android9,
    /// `LoggingModeParamV7`
    Android7,
    /// pointer to a bare int mode
    Android6,
    /// the mode itself passed in place of a pointer
    Legacy,
}

impl SwitchLoggingLayout {
    pub const MAX_ARG_LEN: usize = 24;

    // longest first, so a larger exact match always wins
    pub const ALL: [SwitchLoggingLayout; 5] = [
        SwitchLoggingLayout::Android10,
        SwitchLoggingLayout::Android9,
        SwitchLoggingLayout::Android7,
        SwitchLoggingLayout::Android6,
        SwitchLoggingLayout::Legacy,
    ];

    pub const fn arg_len(self) -> usize {
        match self {
            SwitchLoggingLayout::Android10 => 24,
            SwitchLoggingLayout::Android9 => 20,
            SwitchLoggingLayout::Android7 => 9,
            SwitchLoggingLayout::Android6 => 4,
            SwitchLoggingLayout::Legacy => 0,
        }
    }

    pub fn from_arg_len(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|layout| layout.arg_len() == len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_structure_sizes() {
        assert_eq!(
            LoggingModeParam::default().to_bytes().unwrap().len(),
            SwitchLoggingLayout::Android10.arg_len()
        );
        assert_eq!(
            LoggingModeParamV9::default().to_bytes().unwrap().len(),
            SwitchLoggingLayout::Android9.arg_len()
        );
        assert_eq!(
            LoggingModeParamV7::default().to_bytes().unwrap().len(),
            SwitchLoggingLayout::Android7.arg_len()
        );
        assert_eq!(BufferingMode::default().to_bytes().unwrap().len(), 4);
        assert_eq!(DciRegTable::default().to_bytes().unwrap().len(), 14);
        assert_eq!(ConAllParam::default().to_bytes().unwrap().len(), 12);
    }

    #[test]
    fn test_logging_mode_param_encoding() {
        let param = LoggingModeParam {
            req_mode: MEMORY_DEVICE_MODE as u32,
            peripheral_mask: DIAG_CON_ALL_NO_NPU,
            pd_mask: 0,
            mode_param: 1,
            diag_id: 0,
            pd_val: 0,
            reserved: 0,
            peripheral: -22,
            device_mask: 3,
        };
        assert_eq!(param.to_bytes().unwrap(), vec![
            2, 0, 0, 0,
            0x7f, 0, 0, 0,
            0, 0, 0, 0,
            1, 0, 0, 0,
            0xea, 0xff, 0xff, 0xff,
            3, 0, 0, 0,
        ]);
    }

    #[test]
    fn test_layout_from_arg_len() {
        assert_eq!(SwitchLoggingLayout::from_arg_len(24), Some(SwitchLoggingLayout::Android10));
        assert_eq!(SwitchLoggingLayout::from_arg_len(20), Some(SwitchLoggingLayout::Android9));
        assert_eq!(SwitchLoggingLayout::from_arg_len(9), Some(SwitchLoggingLayout::Android7));
        assert_eq!(SwitchLoggingLayout::from_arg_len(4), Some(SwitchLoggingLayout::Android6));
        assert_eq!(SwitchLoggingLayout::from_arg_len(0), Some(SwitchLoggingLayout::Legacy));
        assert_eq!(SwitchLoggingLayout::from_arg_len(12), None);
        assert_eq!(SwitchLoggingLayout::from_arg_len(25), None);
    }

    #[test]
    fn test_request_container() {
        let req = RequestContainer {
            data_type: DataType::UserSpace,
            use_mdm: false,
            mdm_field: -MDM,
            hdlc_encapsulated_request: vec![1, 2, 3, 4],
        };
        assert_eq!(req.to_bytes().unwrap(), vec![
            32, 0, 0, 0,
            1, 2, 3, 4,
        ]);
        let req = RequestContainer {
            data_type: DataType::UserSpace,
            use_mdm: true,
            mdm_field: -MDM,
            hdlc_encapsulated_request: vec![1, 2, 3, 4],
        };
        assert_eq!(req.to_bytes().unwrap(), vec![
            32, 0, 0, 0,
            255, 255, 255, 255,
            1, 2, 3, 4,
        ]);
    }

    #[test]
    fn test_batch_header() {
        let bytes = [0x20, 0, 0, 0, 3, 0, 0, 0, 0xaa];
        let ((rest, _), header) = BatchHeader::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(header, BatchHeader { data_type: DataType::UserSpace, num_messages: 3 });
        assert_eq!(rest, &[0xaa]);

        let bytes = [0x02, 0, 0, 0, 0, 0, 0, 0];
        let (_, header) = BatchHeader::from_bytes((&bytes, 0)).unwrap();
        assert_eq!(header.data_type, DataType::Other(2));
    }
}
