#![forbid(unsafe_code)]
//! Binary object prefix and variable-field descriptors.
//!
//! Every stored blob begins with the fixed 40-byte [`GhostHeader`]; all
//! typed field offsets are computed past it. Variable-length fields
//! (strings, arrays) are located through compact array-map entries: a
//! 4-byte small form for blobs under 64 KiB of variable data and an 8-byte
//! large form for bigger payloads.
//!
//! ## Header layout (40 bytes)
//!
//! ```text
//! 0..16   identifier (big-endian header word, then random word)
//! 16..24  owning transaction id
//! 24..26  schema version
//! 26..28  status flags
//! 28..32  mutation counter
//! 32..40  reserved, must be zero
//! ```

use crate::error::{Result, WraithError};
use crate::ident::GhostId;

/// Status flag bits stored in the header.
pub mod flags {
    /// Object is logically deleted; the bytes are never physically freed.
    pub const TOMBSTONE: u16 = 0x0001;
    /// Object lives in a sealed segment and can no longer be mutated in
    /// place.
    pub const SEALED: u16 = 0x0002;
}

/// Fixed binary prefix embedded at offset 0 of every ghost.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GhostHeader {
    /// Identifier assigned at creation, immutable for the object's life.
    pub id: GhostId,
    /// Transaction that owns the object's current version.
    pub txn_id: u64,
    /// Schema version interpreted through the layout registry.
    pub version: u16,
    /// Status bits from [`flags`].
    pub flags: u16,
    /// Monotonically increasing counter bumped on every field write, used
    /// for optimistic-concurrency detection.
    pub mutation: u32,
}

impl GhostHeader {
    /// Encoded size of the header in bytes.
    pub const SIZE: usize = 40;

    /// Builds a header for a freshly allocated object.
    pub fn new(id: GhostId, txn_id: u64, version: u16) -> Self {
        Self {
            id,
            txn_id,
            version,
            flags: 0,
            mutation: 0,
        }
    }

    /// Writes the header into the first 40 bytes of `dst`.
    pub fn write_to(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < Self::SIZE {
            return Err(WraithError::Corruption("ghost header region truncated"));
        }
        dst[0..16].copy_from_slice(&self.id.to_bytes());
        dst[16..24].copy_from_slice(&self.txn_id.to_be_bytes());
        dst[24..26].copy_from_slice(&self.version.to_be_bytes());
        dst[26..28].copy_from_slice(&self.flags.to_be_bytes());
        dst[28..32].copy_from_slice(&self.mutation.to_be_bytes());
        dst[32..40].fill(0);
        Ok(())
    }

    /// Reads a header from the first 40 bytes of `src`.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("ghost header region truncated"));
        }
        let id = GhostId::from_bytes(&src[0..16])?;
        let txn_id = u64::from_be_bytes(src[16..24].try_into().expect("slice is 8 bytes"));
        let version = u16::from_be_bytes(src[24..26].try_into().expect("slice is 2 bytes"));
        let flags = u16::from_be_bytes(src[26..28].try_into().expect("slice is 2 bytes"));
        let mutation = u32::from_be_bytes(src[28..32].try_into().expect("slice is 4 bytes"));
        Ok(Self {
            id,
            txn_id,
            version,
            flags,
            mutation,
        })
    }

    /// Returns `true` when the tombstone bit is set.
    pub fn is_tombstone(&self) -> bool {
        (self.flags & flags::TOMBSTONE) != 0
    }

    /// Increments the mutation counter, wrapping on overflow.
    pub fn bump_mutation(&mut self) {
        self.mutation = self.mutation.wrapping_add(1);
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// 4-byte array-map entry: 5-bit element size, 11-bit element count, 16-bit
/// byte offset. Only valid for blobs whose variable region stays under
/// 64 KiB.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArrayMapSmall {
    packed: u16,
    offset: u16,
}

impl ArrayMapSmall {
    /// Encoded size in bytes.
    pub const SIZE: usize = 4;
    /// Largest representable element size.
    pub const MAX_ELEMENT_SIZE: u32 = (1 << 5) - 1;
    /// Largest representable element count.
    pub const MAX_COUNT: u32 = (1 << 11) - 1;

    /// Builds an entry, validating the packing limits.
    pub fn new(element_size: u32, count: u32, offset: u32) -> Result<Self> {
        if element_size > Self::MAX_ELEMENT_SIZE {
            return Err(WraithError::Config("small array-map element size over 31"));
        }
        if count > Self::MAX_COUNT {
            return Err(WraithError::Config("small array-map count over 2047"));
        }
        if offset > u16::MAX as u32 {
            return Err(WraithError::Config("small array-map offset over 64KiB"));
        }
        Ok(Self {
            packed: ((element_size as u16) << 11) | count as u16,
            offset: offset as u16,
        })
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> u32 {
        (self.packed >> 11) as u32
    }

    /// Number of elements.
    pub fn count(&self) -> u32 {
        (self.packed & Self::MAX_COUNT as u16) as u32
    }

    /// Byte offset of the payload within the blob.
    pub fn offset(&self) -> u32 {
        self.offset as u32
    }

    /// Physical payload size: element size times count.
    pub fn byte_size(&self) -> u32 {
        self.element_size() * self.count()
    }

    /// First byte past the payload.
    pub fn end_offset(&self) -> u32 {
        self.offset() + self.byte_size()
    }

    /// End offset rounded up to a 4-byte boundary.
    pub fn end_offset_aligned4(&self) -> u32 {
        align_up(self.end_offset() as u64, 4) as u32
    }

    /// End offset rounded up to an 8-byte boundary.
    pub fn end_offset_aligned8(&self) -> u32 {
        align_up(self.end_offset() as u64, 8) as u32
    }

    /// Encodes the entry as 4 big-endian bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.packed.to_be_bytes());
        buf[2..4].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    /// Decodes an entry from 4 big-endian bytes.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("small array-map entry truncated"));
        }
        Ok(Self {
            packed: u16::from_be_bytes(src[0..2].try_into().expect("slice is 2 bytes")),
            offset: u16::from_be_bytes(src[2..4].try_into().expect("slice is 2 bytes")),
        })
    }
}

/// 8-byte array-map entry: 8-bit element size, 24-bit element count, 32-bit
/// byte offset.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArrayMapLarge {
    element_size: u8,
    count: u32,
    offset: u32,
}

impl ArrayMapLarge {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;
    /// Largest representable element count.
    pub const MAX_COUNT: u32 = (1 << 24) - 1;

    /// Builds an entry, validating the packing limits.
    pub fn new(element_size: u32, count: u32, offset: u32) -> Result<Self> {
        if element_size > u8::MAX as u32 {
            return Err(WraithError::Config("large array-map element size over 255"));
        }
        if count > Self::MAX_COUNT {
            return Err(WraithError::Config("large array-map count over 2^24"));
        }
        Ok(Self {
            element_size: element_size as u8,
            count,
            offset,
        })
    }

    /// A zero-length, zero-offset placeholder used by initial ghost
    /// templates.
    pub const fn empty() -> Self {
        Self {
            element_size: 0,
            count: 0,
            offset: 0,
        }
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> u32 {
        self.element_size as u32
    }

    /// Number of elements.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Byte offset of the payload within the blob.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Physical payload size: element size times count.
    pub fn byte_size(&self) -> u32 {
        self.element_size() * self.count
    }

    /// First byte past the payload. Computed in 64 bits: a maximal offset
    /// plus a maximal payload does not fit in a u32.
    pub fn end_offset(&self) -> u64 {
        self.offset as u64 + self.byte_size() as u64
    }

    /// End offset rounded up to a 4-byte boundary.
    pub fn end_offset_aligned4(&self) -> u64 {
        align_up(self.end_offset(), 4)
    }

    /// End offset rounded up to an 8-byte boundary.
    pub fn end_offset_aligned8(&self) -> u64 {
        align_up(self.end_offset(), 8)
    }

    /// Encodes the entry as 8 bytes: size, 24-bit big-endian count, 32-bit
    /// big-endian offset.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.element_size;
        let count = self.count.to_be_bytes();
        buf[1..4].copy_from_slice(&count[1..4]);
        buf[4..8].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    /// Decodes an entry from 8 bytes.
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("large array-map entry truncated"));
        }
        let element_size = src[0];
        let count = u32::from_be_bytes([0, src[1], src[2], src[3]]);
        let offset = u32::from_be_bytes(src[4..8].try_into().expect("slice is 4 bytes"));
        Ok(Self {
            element_size,
            count,
            offset,
        })
    }

    /// Checks the bounds invariant against a blob of `blob_len` bytes.
    pub fn check_bounds(&self, blob_len: usize) -> Result<()> {
        if self.end_offset() > blob_len as u64 {
            return Err(WraithError::Corruption(
                "array-map entry extends past the blob",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::GhostKind;

    #[test]
    fn header_roundtrip_is_bit_exact() {
        let mut header = GhostHeader::new(GhostId::new(GhostKind::Entity, 100), 7, 3);
        header.flags = flags::TOMBSTONE;
        header.bump_mutation();
        header.bump_mutation();

        let mut buf = [0u8; GhostHeader::SIZE];
        header.write_to(&mut buf).unwrap();
        let decoded = GhostHeader::from_bytes(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.mutation, 2);
        // Reserved region stays zero.
        assert_eq!(&buf[32..40], &[0u8; 8]);
    }

    #[test]
    fn header_rejects_short_buffers() {
        let header = GhostHeader::new(GhostId::zero(), 0, 1);
        let mut short = [0u8; 39];
        assert!(header.write_to(&mut short).is_err());
        assert!(GhostHeader::from_bytes(&short).is_err());
    }

    #[test]
    fn small_entry_packs_and_computes_offsets() {
        let entry = ArrayMapSmall::new(8, 5, 100).unwrap();
        assert_eq!(entry.element_size(), 8);
        assert_eq!(entry.count(), 5);
        assert_eq!(entry.offset(), 100);
        assert_eq!(entry.byte_size(), 40);
        assert_eq!(entry.end_offset(), 140);
        assert_eq!(entry.end_offset_aligned4(), 140);
        assert_eq!(entry.end_offset_aligned8(), 144);

        let decoded = ArrayMapSmall::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn small_entry_limits_enforced() {
        assert!(ArrayMapSmall::new(32, 0, 0).is_err());
        assert!(ArrayMapSmall::new(0, 2048, 0).is_err());
        assert!(ArrayMapSmall::new(0, 0, 70_000).is_err());
        let max = ArrayMapSmall::new(31, 2047, u16::MAX as u32).unwrap();
        assert_eq!(max.element_size(), 31);
        assert_eq!(max.count(), 2047);
    }

    #[test]
    fn large_entry_packs_and_computes_offsets() {
        let entry = ArrayMapLarge::new(3, 10, 41).unwrap();
        assert_eq!(entry.byte_size(), 30);
        assert_eq!(entry.end_offset(), 71);
        assert_eq!(entry.end_offset_aligned4(), 72);
        assert_eq!(entry.end_offset_aligned8(), 72);

        let bytes = entry.to_bytes();
        assert_eq!(bytes[0], 3);
        let decoded = ArrayMapLarge::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn large_entry_24bit_count_roundtrip() {
        let entry = ArrayMapLarge::new(255, ArrayMapLarge::MAX_COUNT, u32::MAX).unwrap();
        let decoded = ArrayMapLarge::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(decoded.count(), ArrayMapLarge::MAX_COUNT);
        assert_eq!(decoded.element_size(), 255);
        assert_eq!(decoded.offset(), u32::MAX);
        assert!(ArrayMapLarge::new(0, 1 << 24, 0).is_err());
    }

    #[test]
    fn bounds_check_guards_blob_length() {
        let entry = ArrayMapLarge::new(4, 4, 40).unwrap();
        assert!(entry.check_bounds(56).is_ok());
        assert!(entry.check_bounds(55).is_err());
    }

    #[test]
    fn empty_entry_is_all_zero() {
        let entry = ArrayMapLarge::empty();
        assert_eq!(entry.to_bytes(), [0u8; 8]);
        assert_eq!(entry.end_offset(), 0);
        assert_eq!(entry.end_offset_aligned8(), 0);
    }
}
