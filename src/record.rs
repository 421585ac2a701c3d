// src/record.rs

//! On-disk transaction record codec
//!
//! Byte-exact layout (all fields little-endian):
//!
//! ```text
//! offset  size  field
//!   0      4    id          (u32)
//!   4      4    flags       (u32)
//!   8      4    numops      (u32)
//!             --- repeated numops times ---
//!   +0     4    op_len      (u32)    bytes of new payload
//!   +4     4    op_plen     (u32)    bytes of pre-image
//!   +8     8    op_offset   (u64)    absolute offset in data file
//!   +16   op_len   new_payload
//!   +…    op_plen  pre_image
//!             --- trailer ---
//!   …      4    checksum    (u32)
//! ```
//!
//! The write path builds the whole record in memory and appends the
//! checksum itself; the read path never verifies the checksum — that's
//! the recovery engine's job, since only it knows whether a mismatch means
//! "corrupt" or "torn, try again never" (never true here, callers only
//! check once, but the point is the codec shouldn't hardcode the policy).

use std::convert::TryInto;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;
pub const OP_HEADER_LEN: usize = 16;
pub const TRAILER_LEN: usize = 4;

/// Transaction-level flag bits, persisted in the record header.
pub mod flags {
    pub const COMMITTED: u32 = 1 << 0;
    pub const ROLLED_BACK: u32 = 1 << 1;
    pub const ROLLING_BACK: u32 = 1 << 2;
    pub const READ_ONLY: u32 = 1 << 3;
    pub const NO_LOCK: u32 = 1 << 4;
    pub const LINGER: u32 = 1 << 5;
}

/// One (offset, new-payload, pre-image) operation as it appears on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub offset: u64,
    pub new_payload: Vec<u8>,
    pub pre_image: Vec<u8>,
}

impl OpRecord {
    pub fn len(&self) -> u32 {
        self.new_payload.len() as u32
    }

    pub fn plen(&self) -> u32 {
        self.pre_image.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.new_payload.is_empty()
    }

    fn encoded_len(&self) -> usize {
        OP_HEADER_LEN + self.new_payload.len() + self.pre_image.len()
    }
}

/// A decoded (or about-to-be-encoded) transaction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub id: u32,
    pub flags: u32,
    pub ops: Vec<OpRecord>,
}

impl TxRecord {
    /// Serialize header + operations + checksum trailer into one buffer,
    /// ready to be written to a journal file in a single call.
    pub fn encode(&self) -> Vec<u8> {
        let total = HEADER_LEN
            + self.ops.iter().map(OpRecord::encoded_len).sum::<usize>()
            + TRAILER_LEN;
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        for op in &self.ops {
            buf.extend_from_slice(&op.len().to_le_bytes());
            buf.extend_from_slice(&op.plen().to_le_bytes());
            buf.extend_from_slice(&op.offset.to_le_bytes());
            buf.extend_from_slice(&op.new_payload);
            buf.extend_from_slice(&op.pre_image);
        }
        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse a record out of `data` (typically an mmap of the whole
    /// journal file). Does not check the checksum. Fails with
    /// [`Error::Malformed`] if the file is shorter than the fixed header,
    /// any length field would read past the end of `data`, or the total
    /// length doesn't land exactly on the trailer (a torn write leaves
    /// extra or missing bytes).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(Error::Malformed(format!(
                "record of {} bytes shorter than header+trailer",
                data.len()
            )));
        }

        let id = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let flags = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let numops = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;

        let mut pos = HEADER_LEN;
        let mut ops = Vec::with_capacity(numops.min(4096));
        for i in 0..numops {
            if pos + OP_HEADER_LEN > data.len() {
                return Err(Error::Malformed(format!(
                    "operation {i} header runs past end of record"
                )));
            }
            let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let plen = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
            let offset = u64::from_le_bytes(data[pos + 8..pos + 16].try_into().unwrap());
            pos += OP_HEADER_LEN;

            let payload_end = pos
                .checked_add(len)
                .and_then(|p| p.checked_add(plen))
                .ok_or_else(|| Error::Malformed(format!("operation {i} length overflow")))?;
            if payload_end > data.len() {
                return Err(Error::Malformed(format!(
                    "operation {i} payload runs past end of record"
                )));
            }

            let new_payload = data[pos..pos + len].to_vec();
            pos += len;
            let pre_image = data[pos..pos + plen].to_vec();
            pos += plen;

            ops.push(OpRecord {
                offset,
                new_payload,
                pre_image,
            });
        }

        if pos + TRAILER_LEN != data.len() {
            return Err(Error::Malformed(format!(
                "record length {} does not land on trailer after {} bytes of operations",
                data.len(),
                pos
            )));
        }

        Ok(TxRecord { id, flags, ops })
    }

    /// The checksum recorded in the trailer of a raw, undecoded buffer.
    pub fn trailer_checksum(data: &[u8]) -> Option<u32> {
        if data.len() < TRAILER_LEN {
            return None;
        }
        let tail = &data[data.len() - TRAILER_LEN..];
        Some(u32::from_le_bytes(tail.try_into().unwrap()))
    }

    /// Recompute the checksum over every byte except the trailer.
    pub fn compute_checksum(data: &[u8]) -> Option<u32> {
        if data.len() < TRAILER_LEN {
            return None;
        }
        Some(crc32fast::hash(&data[..data.len() - TRAILER_LEN]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TxRecord {
        TxRecord {
            id: 7,
            flags: flags::COMMITTED,
            ops: vec![
                OpRecord {
                    offset: 0,
                    new_payload: b"ABCDE".to_vec(),
                    pre_image: vec![],
                },
                OpRecord {
                    offset: 100,
                    new_payload: b"XYZ".to_vec(),
                    pre_image: b"old".to_vec(),
                },
            ],
        }
    }

    #[test]
    fn round_trips() {
        let rec = sample();
        let encoded = rec.encode();
        let decoded = TxRecord::decode(&encoded).unwrap();
        assert_eq!(rec, decoded);
    }

    #[test]
    fn checksum_matches_trailer_for_untampered_record() {
        let encoded = sample().encode();
        let trailer = TxRecord::trailer_checksum(&encoded).unwrap();
        let recomputed = TxRecord::compute_checksum(&encoded).unwrap();
        assert_eq!(trailer, recomputed);
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let mut encoded = sample().encode();
        let last = encoded.len() - 10;
        encoded[last] ^= 0xff;
        let trailer = TxRecord::trailer_checksum(&encoded).unwrap();
        let recomputed = TxRecord::compute_checksum(&encoded).unwrap();
        assert_ne!(trailer, recomputed);
    }

    #[test]
    fn shorter_than_header_is_malformed() {
        let buf = vec![0u8; 4];
        assert!(TxRecord::decode(&buf).is_err());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut encoded = sample().encode();
        encoded.truncate(encoded.len() - 5);
        assert!(TxRecord::decode(&encoded).is_err());
    }

    #[test]
    fn zero_ops_round_trips() {
        let rec = TxRecord {
            id: 1,
            flags: 0,
            ops: vec![],
        };
        let encoded = rec.encode();
        assert_eq!(TxRecord::decode(&encoded).unwrap(), rec);
    }
}
