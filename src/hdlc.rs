//! HDLC stands for "High-level Data Link Control", which the diag protocol uses
//! to encapsulate its messages. Each frame is the byte-stuffed payload followed
//! by its CRC-16/X-25 and a single 0x7e terminator. Consecutive frames share
//! that terminator, so no leading flag byte is ever emitted.
//!
//! QCSuper's docs describe this in more detail here:
//! <https://github.com/P1sec/QCSuper/blob/master/docs/The%20Diag%20protocol.md#the-diag-protocol-over-usb>

use bytes::Buf;
use crc::Crc;
use thiserror::Error;

pub const MESSAGE_TERMINATOR: u8 = 0x7e;
pub const MESSAGE_ESCAPE_CHAR: u8 = 0x7d;
pub const ESCAPE_XOR: u8 = 0x20;

/// Shortest chunk that can hold a payload byte, a CRC and the terminator.
pub const MIN_FRAME_LEN: usize = 3;

const CHECKSUM_LEN: usize = 2;

/// CRC-16/X-25: init 0xffff, reflected poly 0x8408, xorout 0xffff. The crc
/// crate computes it table-driven, one lookup per byte.
pub const CRC_X25: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HdlcError {
    #[error("Invalid checksum (expected {expected:#06x}, got {actual:#06x})")]
    InvalidChecksum { expected: u16, actual: u16 },
    #[error("No trailing character found (expected 0x7e)")]
    NoTrailingCharacter,
    #[error("Data too short to be HDLC encapsulated ({0} bytes after unescaping)")]
    TooShort(usize),
}

fn push_escaped(out: &mut Vec<u8>, b: u8) {
    match b {
        MESSAGE_TERMINATOR | MESSAGE_ESCAPE_CHAR => {
            out.extend([MESSAGE_ESCAPE_CHAR, b ^ ESCAPE_XOR])
        }
        _ => out.push(b),
    }
}

pub fn hdlc_encapsulate(data: &[u8]) -> Vec<u8> {
    // worst case every byte gets escaped
    let mut result = Vec::with_capacity(2 * (data.len() + CHECKSUM_LEN) + 1);

    for &b in data {
        push_escaped(&mut result, b);
    }
    for b in CRC_X25.checksum(data).to_le_bytes() {
        push_escaped(&mut result, b);
    }

    result.push(MESSAGE_TERMINATOR);
    result
}

/// Unescapes `data` up to (and including) its first terminator and verifies
/// the trailing checksum. Anything after the terminator is ignored. Escaped
/// bytes are restored by XOR, so escape pairs other than 0x7d 0x5e and
/// 0x7d 0x5d are accepted the way the modem's own decoder accepts them.
pub fn hdlc_decapsulate(data: &[u8]) -> Result<Vec<u8>, HdlcError> {
    let mut unescaped = Vec::with_capacity(data.len());
    let mut escaping = false;
    let mut terminated = false;
    for &b in data {
        if escaping {
            unescaped.push(b ^ ESCAPE_XOR);
            escaping = false;
        } else if b == MESSAGE_TERMINATOR {
            terminated = true;
            break;
        } else if b == MESSAGE_ESCAPE_CHAR {
            escaping = true;
        } else {
            unescaped.push(b);
        }
    }

    if !terminated {
        return Err(HdlcError::NoTrailingCharacter);
    }
    if unescaped.len() <= CHECKSUM_LEN {
        return Err(HdlcError::TooShort(unescaped.len()));
    }

    // pop off the u16 checksum, check it against what we calculated
    let body_len = unescaped.len() - CHECKSUM_LEN;
    let expected = (&unescaped[body_len..]).get_u16_le();
    unescaped.truncate(body_len);
    let actual = CRC_X25.checksum(&unescaped);
    if expected != actual {
        return Err(HdlcError::InvalidChecksum { expected, actual });
    }

    Ok(unescaped)
}

/// Splits a buffer of back-to-back encoded frames into terminator-inclusive
/// chunks. A trailing run with no terminator is not a frame and is dropped.
pub fn split_frames(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split_inclusive(|&b| b == MESSAGE_TERMINATOR)
        .filter(|chunk| chunk.last() == Some(&MESSAGE_TERMINATOR))
}
