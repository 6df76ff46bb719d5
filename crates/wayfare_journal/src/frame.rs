//! Frame envelope for journal batches.
//!
//! Layout: magic (4) + version (2) + kind (1) + length (4) + payload + crc32 (4).
//! The CRC covers everything before it.

use crate::error::{JournalError, JournalResult};

/// Magic bytes identifying a journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"WFJL";

/// Current frame format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + kind (1) + length (4).
pub const FRAME_HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Kind of frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    /// Records appended by normal operation.
    Batch = 1,
    /// Full state written by compaction. Always the first frame.
    Snapshot = 2,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Batch),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub offset: u64,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Result of scanning a byte buffer for frames.
#[derive(Debug)]
pub(crate) struct ScanResult {
    pub frames: Vec<Frame>,
    /// Length of the prefix made of complete, valid frames.
    pub valid_len: u64,
}

pub(crate) fn encode_frame(kind: FrameKind, payload: &[u8]) -> JournalResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| JournalError::Encode("batch larger than 4 GiB".into()))?;

    let mut data = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(kind as u8);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Scans `bytes` for frames.
///
/// An incomplete trailing frame ends the scan without error (torn write).
/// Bad magic, an unknown version or kind, or a CRC mismatch on a complete
/// frame is corruption.
pub(crate) fn scan_frames(bytes: &[u8]) -> JournalResult<ScanResult> {
    let mut frames = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let offset = pos as u64;
        let remaining = &bytes[pos..];
        if remaining.len() < FRAME_HEADER_SIZE {
            break;
        }
        if remaining[0..4] != JOURNAL_MAGIC {
            return Err(JournalError::corrupted(offset, "bad magic"));
        }
        let version = u16::from_le_bytes([remaining[4], remaining[5]]);
        if version != JOURNAL_VERSION {
            return Err(JournalError::corrupted(
                offset,
                format!("unsupported version {version}"),
            ));
        }
        let kind = FrameKind::from_byte(remaining[6])
            .ok_or_else(|| JournalError::corrupted(offset, "unknown frame kind"))?;
        let len = u32::from_le_bytes([remaining[7], remaining[8], remaining[9], remaining[10]])
            as usize;

        let total = FRAME_HEADER_SIZE + len + CRC_SIZE;
        if remaining.len() < total {
            break;
        }

        let body = &remaining[..FRAME_HEADER_SIZE + len];
        let stored = u32::from_le_bytes([
            remaining[total - 4],
            remaining[total - 3],
            remaining[total - 2],
            remaining[total - 1],
        ]);
        if compute_crc32(body) != stored {
            return Err(JournalError::corrupted(offset, "crc mismatch"));
        }

        frames.push(Frame {
            offset,
            kind,
            payload: remaining[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec(),
        });
        pos += total;
    }

    Ok(ScanResult {
        frames,
        valid_len: pos as u64,
    })
}

/// CRC32 (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn scan_reads_back_frames() {
        let mut bytes = encode_frame(FrameKind::Snapshot, b"base").unwrap();
        bytes.extend(encode_frame(FrameKind::Batch, b"delta").unwrap());

        let scan = scan_frames(&bytes).unwrap();
        assert_eq!(scan.frames.len(), 2);
        assert_eq!(scan.frames[0].kind, FrameKind::Snapshot);
        assert_eq!(scan.frames[1].payload, b"delta");
        assert_eq!(scan.valid_len, bytes.len() as u64);
    }

    #[test]
    fn torn_tail_stops_scan() {
        let first = encode_frame(FrameKind::Batch, b"kept").unwrap();
        let second = encode_frame(FrameKind::Batch, b"torn").unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let scan = scan_frames(&bytes).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert_eq!(scan.valid_len, first.len() as u64);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let mut bytes = encode_frame(FrameKind::Batch, b"payload").unwrap();
        bytes[FRAME_HEADER_SIZE + 1] ^= 0xFF;
        assert!(matches!(
            scan_frames(&bytes),
            Err(JournalError::Corrupted { offset: 0, .. })
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = encode_frame(FrameKind::Batch, b"payload").unwrap();
        bytes[0] = b'X';
        assert!(scan_frames(&bytes).is_err());
    }
}
