//! Commit log framing.
//!
//! Each commit is written as one frame:
//!
//! ```text
//! | magic (4) | version (2) | payload len (4) | payload (len) | crc32 (4) |
//! ```
//!
//! All integers are little-endian. The CRC covers everything before it.

use crate::error::{PersistenceError, PersistenceResult};

/// Frame magic bytes.
pub const FRAME_MAGIC: [u8; 4] = *b"DSLG";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

const HEADER_LEN: usize = 4 + 2 + 4;
const TRAILER_LEN: usize = 4;

/// Wraps a payload in a checksummed frame.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let crc = crc32(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Reads one frame from the start of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only part of a frame, and the payload
/// plus the number of bytes consumed otherwise.
pub fn decode_frame(buf: &[u8]) -> PersistenceResult<Option<(&[u8], usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[..4] != FRAME_MAGIC {
        return Err(PersistenceError::corrupted("bad frame magic"));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != FRAME_VERSION {
        return Err(PersistenceError::corrupted(format!(
            "unsupported frame version {version}"
        )));
    }
    let len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    let total = HEADER_LEN + len + TRAILER_LEN;
    if buf.len() < total {
        return Ok(None);
    }
    let body_end = HEADER_LEN + len;
    let stored = u32::from_le_bytes([
        buf[body_end],
        buf[body_end + 1],
        buf[body_end + 2],
        buf[body_end + 3],
    ]);
    let computed = crc32(&buf[..body_end]);
    if stored != computed {
        return Err(PersistenceError::corrupted(format!(
            "frame checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }
    Ok(Some((&buf[HEADER_LEN..body_end], total)))
}

/// CRC32 (IEEE polynomial).
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn frame_decodes() {
        let frame = encode_frame(b"hello");
        let (payload, used) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(used, frame.len());
    }

    #[test]
    fn short_frame_is_incomplete() {
        let frame = encode_frame(b"hello");
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
        assert!(decode_frame(&frame[..3]).unwrap().is_none());
    }

    #[test]
    fn flipped_bit_is_corruption() {
        let mut frame = encode_frame(b"hello");
        frame[HEADER_LEN] ^= 0x01;
        assert!(matches!(
            decode_frame(&frame),
            Err(PersistenceError::Corrupted(_))
        ));
    }

    #[test]
    fn consecutive_frames() {
        let mut log = encode_frame(b"one");
        log.extend(encode_frame(b"two"));
        let (first, used) = decode_frame(&log).unwrap().unwrap();
        assert_eq!(first, b"one");
        let (second, _) = decode_frame(&log[used..]).unwrap().unwrap();
        assert_eq!(second, b"two");
    }
}
