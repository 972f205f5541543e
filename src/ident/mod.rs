#![forbid(unsafe_code)]
//! 128-bit time-ordered ghost identifiers.
//!
//! A [`GhostId`] packs a 3-bit kind, a 13-bit schema type, and a 48-bit
//! microsecond timestamp into one header word, followed by 64 bits of
//! thread-local xorshift output. Sorting identifiers therefore sorts first
//! by kind, then type, then creation time, then randomly among
//! same-microsecond siblings.

use std::cell::Cell;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, WraithError};
use crate::sync::thread_token;

/// Microseconds between the Unix epoch and the engine epoch
/// (2020-01-01T00:00:00Z). Timestamps are stored relative to the latter so
/// 48 bits last well past the year 10000.
const EPOCH_OFFSET_MICROS: u64 = 1_577_836_800_000_000;

const KIND_BITS: u32 = 3;
const TYPE_BITS: u32 = 13;
const TIMESTAMP_BITS: u32 = 48;

const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;

const KIND_SHIFT: u32 = 64 - KIND_BITS;
const TYPE_SHIFT: u32 = TIMESTAMP_BITS;

/// Seed fallback when tick count XOR thread token happens to be zero; a
/// xorshift state of zero would stay zero forever.
const SEED_FALLBACK: u64 = 0x9E37_79B9_7F4A_7C15;

/// Encoded length of a [`GhostId`] in bytes.
pub const GHOST_ID_LEN: usize = 16;

/// Classification of a stored object, occupying the top 3 bits of the
/// identifier header word so that sorting groups objects by kind first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum GhostKind {
    /// A regular entity object.
    Entity = 0,
    /// Forward half of a relation.
    ForwardLink = 1,
    /// Backward half of a relation.
    BackwardLink = 2,
    /// A first-class edge object.
    Edge = 3,
    /// An entry in a persistent queue.
    QueueEntry = 4,
    /// An entry in a persistent map.
    MapEntry = 5,
    /// Engine-internal bookkeeping object.
    System = 6,
    /// Reserved / application-defined.
    Other = 7,
}

impl GhostKind {
    /// Maps a raw value onto a kind, masking modulo 8 rather than rejecting.
    pub fn from_raw(raw: u8) -> Self {
        match raw & KIND_MASK as u8 {
            0 => Self::Entity,
            1 => Self::ForwardLink,
            2 => Self::BackwardLink,
            3 => Self::Edge,
            4 => Self::QueueEntry,
            5 => Self::MapEntry,
            6 => Self::System,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for GhostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Entity => "entity",
            Self::ForwardLink => "fwd",
            Self::BackwardLink => "bwd",
            Self::Edge => "edge",
            Self::QueueEntry => "queue",
            Self::MapEntry => "map",
            Self::System => "system",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Globally unique, time-ordered 128-bit object handle.
///
/// Comparison is lexicographic over (header word, random word): kind
/// dominates, then type, then timestamp, then the random tiebreaker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GhostId {
    header: u64,
    random: u64,
}

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(0);
}

fn next_random() -> u64 {
    RNG_STATE.with(|state| {
        let mut x = state.get();
        if x == 0 {
            let ticks = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            x = ticks ^ thread_token();
            if x == 0 {
                x = SEED_FALLBACK;
            }
        }
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.set(x);
        x
    })
}

fn now_micros() -> u64 {
    let unix_micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    unix_micros.saturating_sub(EPOCH_OFFSET_MICROS)
}

impl GhostId {
    /// Generates a fresh identifier stamped with the current time.
    ///
    /// Overflowing `type_id` values are masked modulo 8192, never rejected.
    pub fn new(kind: GhostKind, type_id: u16) -> Self {
        Self::from_parts(kind as u8, type_id, now_micros(), next_random())
    }

    /// Packs explicit parts. Kind is masked modulo 8, type modulo 8192, the
    /// timestamp truncated to 48 bits.
    pub fn from_parts(kind: u8, type_id: u16, micros: u64, random: u64) -> Self {
        let header = ((kind as u64 & KIND_MASK) << KIND_SHIFT)
            | ((type_id as u64 & TYPE_MASK) << TYPE_SHIFT)
            | (micros & TIMESTAMP_MASK);
        Self { header, random }
    }

    /// The object kind encoded in the top 3 bits.
    pub fn kind(&self) -> GhostKind {
        GhostKind::from_raw((self.header >> KIND_SHIFT) as u8)
    }

    /// The 13-bit schema type id.
    pub fn type_id(&self) -> u16 {
        ((self.header >> TYPE_SHIFT) & TYPE_MASK) as u16
    }

    /// Microseconds since the engine epoch, truncated to 48 bits.
    pub fn timestamp_micros(&self) -> u64 {
        self.header & TIMESTAMP_MASK
    }

    /// The 64-bit random tiebreaker word.
    pub fn random(&self) -> u64 {
        self.random
    }

    /// The packed header word (kind | type | timestamp).
    pub fn header_word(&self) -> u64 {
        self.header
    }

    /// Encodes the identifier as 16 big-endian bytes (header word first).
    pub fn to_bytes(&self) -> [u8; GHOST_ID_LEN] {
        let mut buf = [0u8; GHOST_ID_LEN];
        buf[0..8].copy_from_slice(&self.header.to_be_bytes());
        buf[8..16].copy_from_slice(&self.random.to_be_bytes());
        buf
    }

    /// Decodes an identifier from 16 big-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GHOST_ID_LEN {
            return Err(WraithError::Corruption("ghost id truncated"));
        }
        let header = u64::from_be_bytes(bytes[0..8].try_into().expect("slice is 8 bytes"));
        let random = u64::from_be_bytes(bytes[8..16].try_into().expect("slice is 8 bytes"));
        Ok(Self { header, random })
    }

    /// A zero identifier, used only inside unstamped ghost templates.
    pub const fn zero() -> Self {
        Self {
            header: 0,
            random: 0,
        }
    }

    /// Returns `true` for the all-zero template identifier.
    pub fn is_zero(&self) -> bool {
        self.header == 0 && self.random == 0
    }
}

impl fmt::Display for GhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{:012x}-{:016x}",
            self.kind(),
            self.type_id(),
            self.timestamp_micros(),
            self.random
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn pack_unpack_roundtrip() {
        let id = GhostId::from_parts(3, 100, 123_456_789, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(id.kind(), GhostKind::Edge);
        assert_eq!(id.type_id(), 100);
        assert_eq!(id.timestamp_micros(), 123_456_789);
        assert_eq!(id.random(), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn overflowing_inputs_are_masked() {
        let id = GhostId::from_parts(9, 8193, u64::MAX, 7);
        assert_eq!(id.kind(), GhostKind::ForwardLink); // 9 mod 8
        assert_eq!(id.type_id(), 1); // 8193 mod 8192
        assert_eq!(id.timestamp_micros(), TIMESTAMP_MASK);
    }

    #[test]
    fn ordering_priority_kind_type_time_random() {
        let base = GhostId::from_parts(1, 10, 1000, 5);
        let higher_kind = GhostId::from_parts(2, 0, 0, 0);
        let higher_type = GhostId::from_parts(1, 11, 0, 0);
        let later = GhostId::from_parts(1, 10, 1001, 0);
        let bigger_random = GhostId::from_parts(1, 10, 1000, 6);
        assert!(base < higher_kind);
        assert!(base < higher_type);
        assert!(base < later);
        assert!(base < bigger_random);

        let mut sorted = vec![higher_kind, bigger_random, later, base, higher_type];
        sorted.sort();
        assert_eq!(sorted, vec![base, bigger_random, later, higher_type, higher_kind]);
    }

    #[test]
    fn equal_fields_mean_equal_ids_and_hashes() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let a = GhostId::from_parts(4, 7, 42, 99);
        let b = GhostId::from_parts(4, 7, 42, 99);
        assert_eq!(a, b);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn tight_loop_generation_never_repeats() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = GhostId::new(GhostKind::Entity, 1);
            assert!(seen.insert(id), "duplicate identifier generated: {id}");
        }
    }

    #[test]
    fn display_format_renders_all_fields() {
        let id = GhostId::from_parts(0, 100, 0xABC, 0x1234);
        assert_eq!(id.to_string(), "entity-100-000000000abc-0000000000001234");
    }

    #[test]
    fn byte_roundtrip_is_bit_exact() {
        let id = GhostId::new(GhostKind::MapEntry, 4242);
        let decoded = GhostId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        assert!(GhostId::from_bytes(&[0u8; 15]).is_err());
    }

    #[test]
    fn byte_order_matches_logical_order() {
        let a = GhostId::from_parts(1, 5, 100, 9);
        let b = GhostId::from_parts(1, 5, 101, 0);
        assert!(a < b);
        assert!(a.to_bytes() < b.to_bytes());
    }

    proptest! {
        #[test]
        fn roundtrip_prop(kind in 0u8..=255, type_id in 0u16..=u16::MAX, micros in any::<u64>(), random in any::<u64>()) {
            let id = GhostId::from_parts(kind, type_id, micros, random);
            prop_assert_eq!(id.kind() as u8, kind & 7);
            prop_assert_eq!(id.type_id(), type_id & 0x1FFF);
            prop_assert_eq!(id.timestamp_micros(), micros & ((1 << 48) - 1));
            prop_assert_eq!(id.random(), random);
            let decoded = GhostId::from_bytes(&id.to_bytes()).unwrap();
            prop_assert_eq!(id, decoded);
        }
    }
}
