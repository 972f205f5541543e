#![forbid(unsafe_code)]
//! Versioned layout descriptors and the typed ghost view built on them.
//!
//! A [`Layout`] fixes the byte offset of every field of one body type at one
//! schema version, computed once at registration and cached for the process
//! lifetime. A [`Ghost`] pairs a blob (owned or mapped) with its layout and
//! exposes typed field access; mutating a read-only mapped ghost first
//! copies the blob into a private buffer.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::arena::Segment;
use crate::error::{Result, WraithError};
use crate::ghost::{align_up, flags, ArrayMapLarge, GhostHeader};
use crate::ident::{GhostId, GHOST_ID_LEN};

/// Wire type of one fixed-size field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[allow(missing_docs)]
pub enum FieldKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// A full 16-byte identifier.
    Id,
}

impl FieldKind {
    /// Encoded size in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
            Self::Id => GHOST_ID_LEN as u32,
        }
    }

    /// Natural alignment; identifiers align like their 8-byte words.
    pub fn align(&self) -> u32 {
        match self {
            Self::Id => 8,
            _ => self.size(),
        }
    }
}

/// One fixed-size field in a layout, in declaration order.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    /// Field name, unique within the layout.
    pub name: &'static str,
    /// Wire type of the field.
    pub kind: FieldKind,
}

/// One variable-length slot, described by an array-map entry in the blob.
#[derive(Clone, Copy, Debug)]
pub struct ArraySlotSpec {
    /// Slot name, unique within the layout.
    pub name: &'static str,
    /// Size of one element of the slot's payload.
    pub element_size: u32,
}

/// Declares the schema of one body type at one version.
///
/// Builders are registered explicitly at start-up; the registry computes
/// offsets and the initial-ghost template from them once.
pub trait LayoutBuilder {
    /// Body type id (13-bit space shared with [`GhostId`]).
    fn body_type(&self) -> u16;
    /// Schema version, 1-based.
    fn version(&self) -> u16;
    /// Fixed-size fields in declaration order.
    fn fields(&self) -> Vec<FieldSpec>;
    /// Variable-length slots in declaration order.
    fn array_slots(&self) -> Vec<ArraySlotSpec> {
        Vec::new()
    }
}

struct FieldEntry {
    spec: FieldSpec,
    offset: u32,
}

/// Immutable per-(type, version) offset record.
///
/// Offsets start just past the 40-byte header and respect each field's
/// natural alignment, padding inserted explicitly. The array-map region of
/// 8-byte entries sits immediately after the fixed fields.
pub struct Layout {
    body_type: u16,
    version: u16,
    fields: Vec<FieldEntry>,
    by_name: FxHashMap<&'static str, usize>,
    slots: Vec<ArraySlotSpec>,
    slot_by_name: FxHashMap<&'static str, usize>,
    array_region: u32,
    ghost_len: usize,
    template: Vec<u8>,
}

impl Layout {
    fn build(builder: &dyn LayoutBuilder) -> Result<Self> {
        if builder.version() == 0 {
            return Err(WraithError::Config("layout versions are 1-based"));
        }
        let specs = builder.fields();
        let mut fields = Vec::with_capacity(specs.len());
        let mut by_name = FxHashMap::default();
        let mut cursor = GhostHeader::SIZE as u32;
        for spec in specs {
            cursor = align_up(cursor as u64, spec.kind.align() as u64) as u32;
            if by_name.insert(spec.name, fields.len()).is_some() {
                return Err(WraithError::Config("duplicate field name in layout"));
            }
            fields.push(FieldEntry { spec, offset: cursor });
            cursor += spec.kind.size();
        }
        let slots = builder.array_slots();
        let mut slot_by_name = FxHashMap::default();
        for (index, slot) in slots.iter().enumerate() {
            if slot_by_name.insert(slot.name, index).is_some() {
                return Err(WraithError::Config("duplicate array slot name in layout"));
            }
        }
        let array_region = align_up(cursor as u64, 4) as u32;
        let ghost_len = array_region as usize + slots.len() * ArrayMapLarge::SIZE;

        let mut template = vec![0u8; ghost_len];
        template[24..26].copy_from_slice(&builder.version().to_be_bytes());
        let empty = ArrayMapLarge::empty().to_bytes();
        for index in 0..slots.len() {
            let at = array_region as usize + index * ArrayMapLarge::SIZE;
            template[at..at + ArrayMapLarge::SIZE].copy_from_slice(&empty);
        }

        Ok(Self {
            body_type: builder.body_type(),
            version: builder.version(),
            fields,
            by_name,
            slots,
            slot_by_name,
            array_region,
            ghost_len,
            template,
        })
    }

    /// Body type this layout describes.
    pub fn body_type(&self) -> u16 {
        self.body_type
    }

    /// Schema version, 1-based.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Length of a freshly initialized ghost blob, header included.
    pub fn ghost_len(&self) -> usize {
        self.ghost_len
    }

    /// Byte offset of the array-map entry region.
    pub fn array_region(&self) -> u32 {
        self.array_region
    }

    /// Offset and kind of a fixed field.
    pub fn field(&self, name: &str) -> Result<(u32, FieldKind)> {
        let index = *self
            .by_name
            .get(name)
            .ok_or(WraithError::Config("unknown field name"))?;
        let entry = &self.fields[index];
        Ok((entry.offset, entry.spec.kind))
    }

    /// Declared element size and entry offset of an array slot.
    pub fn array_slot(&self, name: &str) -> Result<(u32, u32)> {
        let index = *self
            .slot_by_name
            .get(name)
            .ok_or(WraithError::Config("unknown array slot name"))?;
        let entry_offset = self.array_region + (index * ArrayMapLarge::SIZE) as u32;
        Ok((self.slots[index].element_size, entry_offset))
    }

    /// The initial-ghost template: zeroed fields, stamped version, empty
    /// array-map entries. The identifier and transaction id are stamped by
    /// the caller.
    pub fn template(&self) -> &[u8] {
        &self.template
    }
}

/// Process-lifetime cache of layouts, keyed by body type then version.
///
/// The per-type table is 1-based and auto-expands as higher versions are
/// registered; it never shrinks, and registering a lower version later is
/// allowed.
pub struct LayoutRegistry {
    tables: RwLock<FxHashMap<u16, Vec<Option<Arc<Layout>>>>>,
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(FxHashMap::default()),
        }
    }

    /// Builds and caches the layout a builder declares.
    pub fn register(&self, builder: &dyn LayoutBuilder) -> Result<Arc<Layout>> {
        let layout = Arc::new(Layout::build(builder)?);
        let mut tables = self.tables.write();
        let table = tables.entry(layout.body_type()).or_default();
        let index = (layout.version() - 1) as usize;
        if index >= table.len() {
            table.resize(index + 1, None);
        }
        table[index] = Some(Arc::clone(&layout));
        debug!(
            body_type = layout.body_type(),
            version = layout.version(),
            ghost_len = layout.ghost_len(),
            "registered layout"
        );
        Ok(layout)
    }

    /// Looks up a (type, version) layout; missing registrations are a
    /// configuration error, never built on the fly.
    pub fn get(&self, body_type: u16, version: u16) -> Result<Arc<Layout>> {
        if version == 0 {
            return Err(WraithError::Config("layout versions are 1-based"));
        }
        let tables = self.tables.read();
        tables
            .get(&body_type)
            .and_then(|table| table.get((version - 1) as usize))
            .and_then(|slot| slot.clone())
            .ok_or(WraithError::Config(
                "no layout registered for body type and version",
            ))
    }

    /// Highest registered version for a body type.
    pub fn latest(&self, body_type: u16) -> Result<Arc<Layout>> {
        let tables = self.tables.read();
        tables
            .get(&body_type)
            .and_then(|table| table.iter().rev().find_map(|slot| slot.clone()))
            .ok_or(WraithError::Config("no layout registered for body type"))
    }
}

/// Where a ghost's bytes live.
#[derive(Clone)]
pub enum GhostData {
    /// A private, mutable buffer owned by this ghost.
    Owned(Vec<u8>),
    /// A view over segment storage. Read-only views copy-on-write into an
    /// owned buffer on first mutation.
    Mapped {
        /// Segment holding the blob.
        segment: Arc<Segment>,
        /// Data-relative offset of the blob.
        offset: u32,
        /// Blob length in bytes.
        len: u32,
        /// Whether writes may land in the segment directly.
        writable: bool,
    },
}

/// A typed view over one stored blob.
#[derive(Clone)]
pub struct Ghost {
    data: GhostData,
    layout: Arc<Layout>,
}

macro_rules! numeric_field {
    ($get:ident, $set:ident, $ty:ty, $kind:ident) => {
        #[doc = concat!("Reads a `", stringify!($ty), "` field by name.")]
        pub fn $get(&self, name: &str) -> Result<$ty> {
            let (offset, kind) = self.layout.field(name)?;
            if kind != FieldKind::$kind {
                return Err(WraithError::Config("field kind mismatch"));
            }
            let bytes = self.field_bytes(offset, std::mem::size_of::<$ty>())?;
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            raw.copy_from_slice(bytes);
            Ok(<$ty>::from_be_bytes(raw))
        }

        #[doc = concat!("Writes a `", stringify!($ty), "` field by name.")]
        pub fn $set(&mut self, name: &str, value: $ty) -> Result<()> {
            let (offset, kind) = self.layout.field(name)?;
            if kind != FieldKind::$kind {
                return Err(WraithError::Config("field kind mismatch"));
            }
            self.write_field(offset, &value.to_be_bytes())
        }
    };
}

impl Ghost {
    /// Creates a standalone ghost from the layout's template, stamping the
    /// identifier and owning-transaction id into the header.
    pub fn standalone(layout: Arc<Layout>, id: GhostId, txn_id: u64) -> Result<Self> {
        let mut buf = layout.template().to_vec();
        let header = GhostHeader::new(id, txn_id, layout.version());
        header.write_to(&mut buf)?;
        Ok(Self {
            data: GhostData::Owned(buf),
            layout,
        })
    }

    /// Wraps an already-initialized blob in a private buffer.
    pub fn owned(layout: Arc<Layout>, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < layout.ghost_len() {
            return Err(WraithError::Corruption("blob shorter than layout"));
        }
        Ok(Self {
            data: GhostData::Owned(bytes),
            layout,
        })
    }

    /// Wraps a blob already resident in a segment.
    pub fn mapped(
        layout: Arc<Layout>,
        segment: Arc<Segment>,
        offset: u32,
        len: u32,
        writable: bool,
    ) -> Result<Self> {
        if (len as usize) < layout.ghost_len() {
            return Err(WraithError::Corruption("mapped blob shorter than layout"));
        }
        // Validates bounds up front so later reads borrow infallibly.
        segment.read(offset, len as usize)?;
        Ok(Self {
            data: GhostData::Mapped {
                segment,
                offset,
                len,
                writable,
            },
            layout,
        })
    }

    /// The layout this ghost was built against.
    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    /// Full blob bytes, wherever they live.
    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.data {
            GhostData::Owned(buf) => Ok(buf),
            GhostData::Mapped {
                segment,
                offset,
                len,
                ..
            } => segment.read(*offset, *len as usize),
        }
    }

    /// Decoded copy of the 40-byte header.
    pub fn header(&self) -> Result<GhostHeader> {
        GhostHeader::from_bytes(self.bytes()?)
    }

    /// The ghost's identifier.
    pub fn id(&self) -> Result<GhostId> {
        Ok(self.header()?.id)
    }

    /// Current mutation counter, for optimistic-concurrency checks.
    pub fn mutation(&self) -> Result<u32> {
        Ok(self.header()?.mutation)
    }

    /// Whether the blob lives in a segment rather than a private buffer,
    /// and where; used to flush mapped ghosts at commit.
    pub fn mapped_range(&self) -> Option<(Arc<Segment>, u32, u32)> {
        match &self.data {
            GhostData::Owned(_) => None,
            GhostData::Mapped {
                segment,
                offset,
                len,
                ..
            } => Some((Arc::clone(segment), *offset, *len)),
        }
    }

    /// Re-stamps the owning-transaction id, for hand-off of a committed
    /// blob into a new scope. Does not count as a field mutation.
    pub fn adopt(&mut self, txn_id: u64) -> Result<()> {
        self.write_raw(16, &txn_id.to_be_bytes())
    }

    /// Marks the ghost logically deleted. Storage is never reclaimed.
    pub fn tombstone(&mut self) -> Result<()> {
        let header = self.header()?;
        let raw = (header.flags | flags::TOMBSTONE).to_be_bytes();
        self.write_field(26, &raw)
    }

    /// Whether the tombstone flag is set.
    pub fn is_tombstone(&self) -> Result<bool> {
        Ok(self.header()?.is_tombstone())
    }

    numeric_field!(get_u8, set_u8, u8, U8);
    numeric_field!(get_u16, set_u16, u16, U16);
    numeric_field!(get_u32, set_u32, u32, U32);
    numeric_field!(get_u64, set_u64, u64, U64);
    numeric_field!(get_i8, set_i8, i8, I8);
    numeric_field!(get_i16, set_i16, i16, I16);
    numeric_field!(get_i32, set_i32, i32, I32);
    numeric_field!(get_i64, set_i64, i64, I64);
    numeric_field!(get_f32, set_f32, f32, F32);
    numeric_field!(get_f64, set_f64, f64, F64);

    /// Reads a `bool` field by name.
    pub fn get_bool(&self, name: &str) -> Result<bool> {
        let (offset, kind) = self.layout.field(name)?;
        if kind != FieldKind::Bool {
            return Err(WraithError::Config("field kind mismatch"));
        }
        Ok(self.field_bytes(offset, 1)?[0] != 0)
    }

    /// Writes a `bool` field by name.
    pub fn set_bool(&mut self, name: &str, value: bool) -> Result<()> {
        let (offset, kind) = self.layout.field(name)?;
        if kind != FieldKind::Bool {
            return Err(WraithError::Config("field kind mismatch"));
        }
        self.write_field(offset, &[value as u8])
    }

    /// Reads an identifier field by name.
    pub fn get_id(&self, name: &str) -> Result<GhostId> {
        let (offset, kind) = self.layout.field(name)?;
        if kind != FieldKind::Id {
            return Err(WraithError::Config("field kind mismatch"));
        }
        GhostId::from_bytes(self.field_bytes(offset, GHOST_ID_LEN)?)
    }

    /// Writes an identifier field by name.
    pub fn set_id(&mut self, name: &str, value: GhostId) -> Result<()> {
        let (offset, kind) = self.layout.field(name)?;
        if kind != FieldKind::Id {
            return Err(WraithError::Config("field kind mismatch"));
        }
        self.write_field(offset, &value.to_bytes())
    }

    /// Reads an array slot's payload, or an empty slice for an unwritten
    /// slot.
    pub fn get_array(&self, name: &str) -> Result<(ArrayMapLarge, &[u8])> {
        let (_, entry_offset) = self.layout.array_slot(name)?;
        let bytes = self.bytes()?;
        let entry = ArrayMapLarge::from_bytes(&bytes[entry_offset as usize..])?;
        entry.check_bounds(bytes.len())?;
        let start = entry.offset() as usize;
        let end = start + entry.byte_size() as usize;
        Ok((entry, &bytes[start..end]))
    }

    /// Replaces an array slot's payload. The new payload is appended past
    /// the end of the blob at an 8-byte boundary; the old payload space is
    /// abandoned, never reclaimed.
    ///
    /// Mapped ghosts copy-on-write first: growing a blob in place inside a
    /// segment is not possible.
    pub fn set_array(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let (element_size, entry_offset) = self.layout.array_slot(name)?;
        if element_size == 0 || data.len() % element_size as usize != 0 {
            return Err(WraithError::Config(
                "array payload is not a whole number of elements",
            ));
        }
        let count = (data.len() / element_size as usize) as u32;
        self.promote()?;
        let GhostData::Owned(buf) = &mut self.data else {
            return Err(WraithError::Corruption("array write on a mapped blob"));
        };
        let start = align_up(buf.len() as u64, 8) as usize;
        let entry = ArrayMapLarge::new(element_size, count, start as u32)?;
        buf.resize(start, 0);
        buf.extend_from_slice(data);
        let at = entry_offset as usize;
        buf[at..at + ArrayMapLarge::SIZE].copy_from_slice(&entry.to_bytes());
        self.bump_mutation()
    }

    fn field_bytes(&self, offset: u32, len: usize) -> Result<&[u8]> {
        let bytes = self.bytes()?;
        let start = offset as usize;
        if start + len > bytes.len() {
            return Err(WraithError::Corruption("field offset beyond blob"));
        }
        Ok(&bytes[start..start + len])
    }

    /// Writes raw bytes at a field offset and bumps the mutation counter.
    fn write_field(&mut self, offset: u32, raw: &[u8]) -> Result<()> {
        self.write_raw(offset, raw)?;
        self.bump_mutation()
    }

    fn write_raw(&mut self, offset: u32, raw: &[u8]) -> Result<()> {
        self.promote_if_frozen()?;
        match &mut self.data {
            GhostData::Owned(buf) => {
                let start = offset as usize;
                if start + raw.len() > buf.len() {
                    return Err(WraithError::Corruption("field offset beyond blob"));
                }
                buf[start..start + raw.len()].copy_from_slice(raw);
                Ok(())
            }
            GhostData::Mapped {
                segment,
                offset: base,
                len,
                ..
            } => {
                if offset as usize + raw.len() > *len as usize {
                    return Err(WraithError::Corruption("field offset beyond blob"));
                }
                segment.write_at(*base + offset, raw)
            }
        }
    }

    fn bump_mutation(&mut self) -> Result<()> {
        let next = self.mutation()?.wrapping_add(1);
        self.write_raw(28, &next.to_be_bytes())
    }

    /// Copies a read-only mapped blob into a private buffer.
    fn promote_if_frozen(&mut self) -> Result<()> {
        if let GhostData::Mapped {
            writable: false, ..
        } = self.data
        {
            self.promote()?;
        }
        Ok(())
    }

    /// Copies any mapped blob into a private buffer.
    fn promote(&mut self) -> Result<()> {
        if let GhostData::Mapped { .. } = self.data {
            let copy = self.bytes()?.to_vec();
            self.data = GhostData::Owned(copy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::GhostKind;

    struct PersonV1;

    impl LayoutBuilder for PersonV1 {
        fn body_type(&self) -> u16 {
            100
        }
        fn version(&self) -> u16 {
            1
        }
        fn fields(&self) -> Vec<FieldSpec> {
            vec![
                FieldSpec {
                    name: "active",
                    kind: FieldKind::Bool,
                },
                FieldSpec {
                    name: "age",
                    kind: FieldKind::U32,
                },
                FieldSpec {
                    name: "balance",
                    kind: FieldKind::I64,
                },
                FieldSpec {
                    name: "partner",
                    kind: FieldKind::Id,
                },
            ]
        }
        fn array_slots(&self) -> Vec<ArraySlotSpec> {
            vec![
                ArraySlotSpec {
                    name: "name",
                    element_size: 1,
                },
                ArraySlotSpec {
                    name: "scores",
                    element_size: 4,
                },
            ]
        }
    }

    struct PersonV3;

    impl LayoutBuilder for PersonV3 {
        fn body_type(&self) -> u16 {
            100
        }
        fn version(&self) -> u16 {
            3
        }
        fn fields(&self) -> Vec<FieldSpec> {
            vec![FieldSpec {
                name: "age",
                kind: FieldKind::U32,
            }]
        }
    }

    fn registry() -> LayoutRegistry {
        let registry = LayoutRegistry::new();
        registry.register(&PersonV1).unwrap();
        registry
    }

    #[test]
    fn offsets_respect_alignment() {
        let layout = registry().get(100, 1).unwrap();
        assert_eq!(layout.field("active").unwrap(), (40, FieldKind::Bool));
        // One byte of bool, then padding up to the next 4-byte boundary.
        assert_eq!(layout.field("age").unwrap(), (44, FieldKind::U32));
        assert_eq!(layout.field("balance").unwrap(), (48, FieldKind::I64));
        assert_eq!(layout.field("partner").unwrap(), (56, FieldKind::Id));
        assert_eq!(layout.array_region(), 72);
        assert_eq!(layout.ghost_len(), 72 + 2 * ArrayMapLarge::SIZE);
        assert!(matches!(
            layout.field("missing"),
            Err(WraithError::Config(_))
        ));
    }

    #[test]
    fn template_stamps_version_and_empty_slots() {
        let layout = registry().get(100, 1).unwrap();
        let template = layout.template();
        assert_eq!(&template[24..26], &1u16.to_be_bytes());
        let entry = ArrayMapLarge::from_bytes(&template[72..80]).unwrap();
        assert_eq!(entry.count(), 0);
        assert_eq!(entry.offset(), 0);
    }

    #[test]
    fn registry_expands_but_never_shrinks() {
        let registry = registry();
        registry.register(&PersonV3).unwrap();
        assert!(registry.get(100, 1).is_ok());
        assert!(registry.get(100, 3).is_ok());
        assert!(matches!(
            registry.get(100, 2),
            Err(WraithError::Config(_))
        ));
        assert_eq!(registry.latest(100).unwrap().version(), 3);
        // Re-registering a lower version keeps version 3 available.
        registry.register(&PersonV1).unwrap();
        assert!(registry.get(100, 3).is_ok());
    }

    #[test]
    fn standalone_ghost_round_trips_fields() {
        let layout = registry().get(100, 1).unwrap();
        let id = GhostId::new(GhostKind::Entity, 100);
        let mut ghost = Ghost::standalone(layout, id, 7).unwrap();
        assert_eq!(ghost.id().unwrap(), id);
        assert_eq!(ghost.header().unwrap().txn_id, 7);
        assert_eq!(ghost.mutation().unwrap(), 0);

        ghost.set_bool("active", true).unwrap();
        ghost.set_u32("age", 41).unwrap();
        ghost.set_i64("balance", -250).unwrap();
        let partner = GhostId::new(GhostKind::Entity, 100);
        ghost.set_id("partner", partner).unwrap();

        assert!(ghost.get_bool("active").unwrap());
        assert_eq!(ghost.get_u32("age").unwrap(), 41);
        assert_eq!(ghost.get_i64("balance").unwrap(), -250);
        assert_eq!(ghost.get_id("partner").unwrap(), partner);
        assert_eq!(ghost.mutation().unwrap(), 4);
        assert!(matches!(
            ghost.set_u64("age", 1),
            Err(WraithError::Config(_))
        ));
    }

    #[test]
    fn arrays_append_aligned_and_replace() {
        let layout = registry().get(100, 1).unwrap();
        let id = GhostId::new(GhostKind::Entity, 100);
        let mut ghost = Ghost::standalone(layout, id, 1).unwrap();

        ghost.set_array("name", b"wraith").unwrap();
        let (entry, payload) = ghost.get_array("name").unwrap();
        assert_eq!(payload, b"wraith");
        assert_eq!(entry.offset() % 8, 0);

        // Replacing abandons the old payload, it never shrinks the blob.
        let before = ghost.bytes().unwrap().len();
        ghost.set_array("name", b"longer than before").unwrap();
        let (_, payload) = ghost.get_array("name").unwrap();
        assert_eq!(payload, b"longer than before");
        assert!(ghost.bytes().unwrap().len() > before);

        let scores: Vec<u8> = [1u32, 2, 3]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect();
        ghost.set_array("scores", &scores).unwrap();
        let (entry, payload) = ghost.get_array("scores").unwrap();
        assert_eq!(entry.count(), 3);
        assert_eq!(payload, scores.as_slice());

        assert!(matches!(
            ghost.set_array("scores", &scores[..5]),
            Err(WraithError::Config(_))
        ));
    }

    #[test]
    fn frozen_mapped_ghost_copies_on_write() {
        let layout = registry().get(100, 1).unwrap();
        let id = GhostId::new(GhostKind::Entity, 100);
        let ghost = Ghost::standalone(Arc::clone(&layout), id, 1).unwrap();

        let segment = Arc::new(Segment::volatile(0, 4096));
        let blob = ghost.bytes().unwrap().to_vec();
        let offset = segment.write(&blob).unwrap();

        let mut frozen = Ghost::mapped(
            Arc::clone(&layout),
            Arc::clone(&segment),
            offset,
            blob.len() as u32,
            false,
        )
        .unwrap();
        assert!(frozen.mapped_range().is_some());

        frozen.set_u32("age", 99).unwrap();
        // The write landed in a private copy, not the segment.
        assert!(frozen.mapped_range().is_none());
        assert_eq!(frozen.get_u32("age").unwrap(), 99);
        let resident = Ghost::mapped(layout, segment, offset, blob.len() as u32, true).unwrap();
        assert_eq!(resident.get_u32("age").unwrap(), 0);
    }

    #[test]
    fn writable_mapped_ghost_mutates_in_place() {
        let layout = registry().get(100, 1).unwrap();
        let id = GhostId::new(GhostKind::Entity, 100);
        let ghost = Ghost::standalone(Arc::clone(&layout), id, 1).unwrap();

        let segment = Arc::new(Segment::volatile(0, 4096));
        let blob = ghost.bytes().unwrap().to_vec();
        let offset = segment.write(&blob).unwrap();

        let mut live = Ghost::mapped(
            Arc::clone(&layout),
            Arc::clone(&segment),
            offset,
            blob.len() as u32,
            true,
        )
        .unwrap();
        live.set_u32("age", 7).unwrap();
        assert!(live.mapped_range().is_some());

        let reread = Ghost::mapped(layout, segment, offset, blob.len() as u32, false).unwrap();
        assert_eq!(reread.get_u32("age").unwrap(), 7);
        assert_eq!(reread.mutation().unwrap(), 1);
    }

    #[test]
    fn tombstone_is_logical() {
        let layout = registry().get(100, 1).unwrap();
        let id = GhostId::new(GhostKind::Entity, 100);
        let mut ghost = Ghost::standalone(layout, id, 1).unwrap();
        assert!(!ghost.is_tombstone().unwrap());
        ghost.tombstone().unwrap();
        assert!(ghost.is_tombstone().unwrap());
        // The blob itself survives.
        assert_eq!(ghost.id().unwrap(), id);
    }
}
