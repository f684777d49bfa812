//! On-disk needle record format.
//!
//! A needle is the unit of storage inside a volume file:
//! `[8B id][4B cookie][4B data_size][8B create_time][1B flags][data][4B crc32]`,
//! all integers big-endian. The CRC32 (IEEE) covers the data bytes only.

use std::io::{Read, Write};

/// Fixed header size: id + cookie + data_size + create_time + flags.
pub const NEEDLE_HEADER_SIZE: usize = 8 + 4 + 4 + 8 + 1;

/// Fixed footer size: CRC32 of the data.
pub const NEEDLE_FOOTER_SIZE: usize = 4;

/// Tombstone bit in the flags byte.
pub const FLAG_DELETED: u8 = 0x01;

/// Upper bound on a single needle's payload. Anything larger during decode
/// is treated as corruption rather than an allocation request.
const MAX_DATA_SIZE: u32 = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum NeedleError {
    #[error("needle I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("needle CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("invalid needle: {0}")]
    Invalid(String),
}

/// A single record stored inside a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Needle {
    /// Store-wide unique identifier.
    pub id: u64,
    /// Write-time nonce (create timestamp in seconds). Informational only.
    pub cookie: u32,
    /// Seconds since the Unix epoch at write time.
    pub create_time: i64,
    /// Bit 0 marks a tombstone.
    pub flags: u8,
    /// The payload.
    pub data: Vec<u8>,
}

impl Needle {
    /// Create a live needle.
    pub fn new(id: u64, cookie: u32, create_time: i64, data: Vec<u8>) -> Self {
        Self {
            id,
            cookie,
            create_time,
            flags: 0,
            data,
        }
    }

    /// Payload length in bytes.
    pub fn data_size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Total on-disk footprint: header + data + footer.
    pub fn encoded_size(&self) -> u64 {
        (NEEDLE_HEADER_SIZE + self.data.len() + NEEDLE_FOOTER_SIZE) as u64
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn mark_deleted(&mut self) {
        self.flags |= FLAG_DELETED;
    }

    /// Append the encoded needle to `w`: header, data, then CRC32 footer.
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), NeedleError> {
        w.write_all(&self.id.to_be_bytes())?;
        w.write_all(&self.cookie.to_be_bytes())?;
        w.write_all(&self.data_size().to_be_bytes())?;
        w.write_all(&self.create_time.to_be_bytes())?;
        w.write_all(&[self.flags])?;
        w.write_all(&self.data)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data);
        w.write_all(&hasher.finalize().to_be_bytes())?;
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NeedleError> {
        let mut buf = Vec::with_capacity(self.encoded_size() as usize);
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one needle from `r`. Reads are strictly sequential; there is
    /// no framing magic to resync on, so the caller must stop at the first
    /// error when scanning a volume.
    pub fn decode<R: Read>(r: &mut R) -> Result<Self, NeedleError> {
        let mut b8 = [0u8; 8];
        let mut b4 = [0u8; 4];
        let mut b1 = [0u8; 1];

        r.read_exact(&mut b8)?;
        let id = u64::from_be_bytes(b8);
        r.read_exact(&mut b4)?;
        let cookie = u32::from_be_bytes(b4);
        r.read_exact(&mut b4)?;
        let data_size = u32::from_be_bytes(b4);
        r.read_exact(&mut b8)?;
        let create_time = i64::from_be_bytes(b8);
        r.read_exact(&mut b1)?;
        let flags = b1[0];

        if data_size > MAX_DATA_SIZE {
            return Err(NeedleError::Invalid(format!(
                "data_size {} exceeds maximum {}",
                data_size, MAX_DATA_SIZE
            )));
        }

        let mut data = vec![0u8; data_size as usize];
        r.read_exact(&mut data)?;

        r.read_exact(&mut b4)?;
        let expected = u32::from_be_bytes(b4);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);
        let actual = hasher.finalize();
        if actual != expected {
            return Err(NeedleError::CrcMismatch { expected, actual });
        }

        Ok(Self {
            id,
            cookie,
            create_time,
            flags,
            data,
        })
    }
}

/// In-memory index entry: where a needle lives and whether it is tombstoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleInfo {
    /// Byte offset of the needle header within the volume file.
    pub offset: u64,
    /// Payload size (not the encoded size).
    pub size: u32,
    /// Bit 0 marks a tombstone.
    pub flags: u8,
    /// Owning volume.
    pub volume_id: u32,
}

impl NeedleInfo {
    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn mark_deleted(&mut self) {
        self.flags |= FLAG_DELETED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_needle() -> Needle {
        Needle::new(42, 1_700_000_000, 1_700_000_000, b"hello needle".to_vec())
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let needle = sample_needle();
        let bytes = needle.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, needle.encoded_size());

        let decoded = Needle::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, needle);
    }

    #[test]
    fn test_encoded_layout_big_endian() {
        let needle = Needle::new(0x0102_0304_0506_0708, 0xAABBCCDD, 0x11, b"ab".to_vec());
        let bytes = needle.to_bytes().unwrap();

        // id at offset 0
        assert_eq!(&bytes[0..8], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        // cookie at offset 8
        assert_eq!(&bytes[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
        // data_size at offset 12
        assert_eq!(&bytes[12..16], &[0x00, 0x00, 0x00, 0x02]);
        // create_time at offset 16
        assert_eq!(&bytes[16..24], &[0, 0, 0, 0, 0, 0, 0, 0x11]);
        // flags at offset 24
        assert_eq!(bytes[24], 0);
        // data at offset 25
        assert_eq!(&bytes[25..27], b"ab");
        // footer CRC over data only
        let crc = u32::from_be_bytes(bytes[27..31].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(b"ab"));
        assert_eq!(bytes.len(), 31);
    }

    #[test]
    fn test_empty_payload() {
        let needle = Needle::new(1, 0, 0, Vec::new());
        assert_eq!(needle.encoded_size(), 29);
        let bytes = needle.to_bytes().unwrap();
        let decoded = Needle::decode(&mut bytes.as_slice()).unwrap();
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_decode_detects_corrupt_data() {
        let needle = sample_needle();
        let mut bytes = needle.to_bytes().unwrap();

        // Flip one bit inside the payload
        bytes[NEEDLE_HEADER_SIZE] ^= 0x01;

        match Needle::decode(&mut bytes.as_slice()) {
            Err(NeedleError::CrcMismatch { expected, actual }) => {
                assert_ne!(expected, actual);
            }
            other => panic!("expected CrcMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_fails() {
        let needle = sample_needle();
        let bytes = needle.to_bytes().unwrap();

        // Chop mid-payload: decode must fail with an I/O error, not garbage.
        let truncated = &bytes[..NEEDLE_HEADER_SIZE + 3];
        assert!(matches!(
            Needle::decode(&mut &truncated[..]),
            Err(NeedleError::Io(_))
        ));
    }

    #[test]
    fn test_decode_rejects_absurd_data_size() {
        let mut bytes = sample_needle().to_bytes().unwrap();
        // Overwrite data_size with something enormous
        bytes[12..16].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Needle::decode(&mut bytes.as_slice()),
            Err(NeedleError::Invalid(_))
        ));
    }

    #[test]
    fn test_tombstone_flags() {
        let mut needle = sample_needle();
        assert!(!needle.is_deleted());
        needle.mark_deleted();
        assert!(needle.is_deleted());

        let mut info = NeedleInfo {
            offset: 0,
            size: 4,
            flags: 0,
            volume_id: 1,
        };
        assert!(!info.is_deleted());
        info.mark_deleted();
        assert!(info.is_deleted());
        // Marking twice is idempotent
        info.mark_deleted();
        assert_eq!(info.flags, FLAG_DELETED);
    }

    #[test]
    fn test_deleted_flag_survives_roundtrip() {
        let mut needle = sample_needle();
        needle.mark_deleted();
        let bytes = needle.to_bytes().unwrap();
        let decoded = Needle::decode(&mut bytes.as_slice()).unwrap();
        assert!(decoded.is_deleted());
    }
}
