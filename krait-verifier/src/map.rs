//! Opaque runtime map objects.
//!
//! The verifier sees maps only through their declared shapes: key and value
//! sizes, addressing capabilities, and the table of typed fields embedded in
//! the value area. The runtime's operations vtable never enters the core.

use crate::ktype::KtypeId;

/// Index of a resolved map in the verifier's `used_maps` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u32);

impl core::fmt::Display for MapId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

/// Map families the verifier distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum MapKind {
    /// Hash table keyed by arbitrary bytes.
    Hash,
    /// Flat array keyed by a 32-bit index.
    Array,
    /// Per-CPU variant of [`MapKind::Array`].
    PercpuArray,
    /// Ring buffer; reservations are references.
    Ringbuf,
}

impl MapKind {
    /// Whether a value address can be materialized at load time, making the
    /// `map[fd].value + off` immediate-load form legal.
    pub const fn direct_value_addr(self) -> bool {
        matches!(self, Self::Array)
    }

    /// Whether lookups return per-CPU addresses.
    pub const fn percpu(self) -> bool {
        matches!(self, Self::PercpuArray)
    }

    /// Whether element lookup helpers apply to this family.
    pub const fn supports_lookup(self) -> bool {
        !matches!(self, Self::Ringbuf)
    }
}

/// Typed fields that may be embedded in a map value (or an allocated
/// object). Accesses overlapping one of these must follow its exact
/// protocol instead of plain loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A spinlock word; only lock helpers may touch it.
    SpinLock,
    /// A timer block; only timer helpers may touch it.
    Timer,
    /// A kernel pointer cell; only the exchange protocol may touch it.
    Kptr {
        /// Pointee type.
        target: KtypeId,
        /// Whether holders get a trusted reference.
        trusted: bool,
    },
    /// Head of an intrusive linked list.
    ListHead {
        /// Node type the list links.
        node: KtypeId,
    },
    /// Link field of an intrusive list node.
    ListNode,
    /// Root of an intrusive red-black tree.
    RbRoot {
        /// Node type the tree links.
        node: KtypeId,
    },
    /// Link field of a red-black tree node.
    RbNode,
    /// Reference count of a shared allocated object.
    Refcount,
}

impl FieldKind {
    /// Bytes the field occupies in the value layout.
    pub const fn size(self) -> u32 {
        match self {
            Self::SpinLock | Self::Refcount => 4,
            Self::Kptr { .. } | Self::RbRoot { .. } => 8,
            Self::Timer | Self::ListHead { .. } | Self::ListNode => 16,
            Self::RbNode => 24,
        }
    }

    /// Whether plain loads of the exact field are legal (kptr loads are;
    /// lock, timer and link internals are not).
    pub const fn plain_load_ok(self) -> bool {
        matches!(self, Self::Kptr { .. })
    }
}

/// One typed field at a fixed offset of a value layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedField {
    /// Byte offset inside the value.
    pub offset: u32,
    /// Field protocol.
    pub kind: FieldKind,
}

impl TypedField {
    /// Whether `[off, off + size)` overlaps this field.
    pub fn overlaps(&self, off: u64, size: u64) -> bool {
        let f_start = self.offset as u64;
        let f_end = f_start + self.kind.size() as u64;
        off < f_end && off + size > f_start
    }
}

/// Declared shape of one runtime map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapDef {
    /// Name for diagnostics.
    pub name: String,
    /// Family.
    pub kind: MapKind,
    /// Key size in bytes.
    pub key_size: u32,
    /// Value size in bytes.
    pub value_size: u32,
    /// Capacity.
    pub max_entries: u32,
    /// Whether the map was frozen read-only before verification.
    pub frozen: bool,
    /// Initial value bytes of a frozen array map, enabling constant folding
    /// of loads.
    pub rdonly_data: Option<Vec<u8>>,
    /// Typed fields embedded in the value layout, ordered by offset.
    pub fields: Vec<TypedField>,
}

impl MapDef {
    /// Plain data map with no typed fields.
    pub fn plain(name: &str, kind: MapKind, key_size: u32, value_size: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            key_size,
            value_size,
            max_entries: 1,
            frozen: false,
            rdonly_data: None,
            fields: Vec::new(),
        }
    }

    /// The typed field overlapping `[off, off + size)`, if any.
    pub fn field_overlapping(&self, off: u64, size: u64) -> Option<&TypedField> {
        self.fields.iter().find(|f| f.overlaps(off, size))
    }

    /// The typed field of the given kind starting exactly at `off`.
    pub fn field_at(&self, off: u32) -> Option<&TypedField> {
        self.fields.iter().find(|f| f.offset == off)
    }

    /// Offset of the first field with the given discriminating shape.
    pub fn find_field(&self, pred: impl Fn(&FieldKind) -> bool) -> Option<&TypedField> {
        self.fields.iter().find(|f| pred(&f.kind))
    }

    /// Whether loads from this map may be folded to constants.
    pub fn readonly_constant(&self) -> bool {
        self.frozen && self.rdonly_data.is_some()
    }

    /// Fetch `size` little-endian bytes at `off` from frozen data.
    pub fn read_constant(&self, off: u64, size: u64) -> Option<u64> {
        let data = self.rdonly_data.as_ref()?;
        let off = usize::try_from(off).ok()?;
        let size = usize::try_from(size).ok()?;
        let bytes = data.get(off..off.checked_add(size)?)?;
        let mut word = [0u8; 8];
        word[..size].copy_from_slice(bytes);
        Some(u64::from_le_bytes(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_overlap() {
        let field = TypedField {
            offset: 8,
            kind: FieldKind::SpinLock,
        };
        assert!(field.overlaps(8, 4));
        assert!(field.overlaps(10, 1));
        assert!(field.overlaps(4, 8));
        assert!(!field.overlaps(0, 8));
        assert!(!field.overlaps(12, 4));
    }

    #[test]
    fn constant_reads() {
        let mut map = MapDef::plain("ro", MapKind::Array, 4, 16);
        map.frozen = true;
        map.rdonly_data = Some((0u8..16).collect());
        assert_eq!(map.read_constant(0, 4), Some(u64::from_le_bytes([0, 1, 2, 3, 0, 0, 0, 0])));
        assert_eq!(map.read_constant(12, 4), Some(u64::from_le_bytes([12, 13, 14, 15, 0, 0, 0, 0])));
        assert_eq!(map.read_constant(13, 4), None);
    }
}
