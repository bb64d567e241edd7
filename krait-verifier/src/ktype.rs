//! Kernel type information, consumed through typed queries.
//!
//! The verifier never owns the type database; it receives a handle and asks
//! about sizes, fields, and pointer tags. The database here is a plain
//! in-memory registry sufficient for verification and tests; a production
//! loader would populate it from the running kernel's type section.

use crate::error::{
    Reject,
    VResult,
    VerifierError,
};

/// Identifier of a type in the kernel type database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KtypeId(pub u32);

impl core::fmt::Display for KtypeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ktype#{}", self.0)
    }
}

/// How a pointer-typed struct field is tagged in kernel type information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrTag {
    /// Dereference requires an active RCU read-side bracket.
    pub rcu: bool,
    /// The pointee is trusted: refcount held by the containing object.
    pub trusted: bool,
    /// The pointer may be null.
    pub maybe_null: bool,
}

/// One member of a struct type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KtypeField {
    /// Member name.
    pub name: String,
    /// Byte offset within the struct.
    pub offset: u32,
    /// Member size in bytes.
    pub size: u32,
    /// What loading the member yields.
    pub kind: KtypeFieldKind,
}

/// Shape of a struct member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KtypeFieldKind {
    /// Plain data; loads yield scalars.
    Scalar,
    /// A pointer to another kernel type.
    Ptr {
        /// Pointee type.
        target: KtypeId,
        /// Trust and RCU tagging of the pointer.
        tag: PtrTag,
    },
}

/// Shape of a registered type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KtypeKind {
    /// A struct with named members.
    Struct {
        /// Members ordered by offset.
        fields: Vec<KtypeField>,
    },
    /// A global variable of the given mutability.
    Var {
        /// Whether stores through the variable's address are rejected.
        rdonly: bool,
        /// Whether the variable is per-CPU and needs an address resolution
        /// helper before dereference.
        percpu: bool,
    },
}

/// One registered kernel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ktype {
    /// Type name as known to the kernel.
    pub name: String,
    /// Size in bytes.
    pub size: u32,
    /// Shape.
    pub kind: KtypeKind,
}

/// In-memory kernel type database handle.
#[derive(Debug, Default)]
pub struct KtypeDb {
    types: Vec<Ktype>,
}

impl KtypeDb {
    /// Empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, returning its id.
    pub fn register(&mut self, ktype: Ktype) -> KtypeId {
        self.types.push(ktype);
        KtypeId(self.types.len() as u32 - 1)
    }

    /// Look up a type by id.
    pub fn get(&self, id: KtypeId) -> Option<&Ktype> {
        self.types.get(id.0 as usize)
    }

    /// Look up a type by id, reporting a structural rejection when absent.
    pub fn resolve(&self, id: KtypeId, insn_idx: usize) -> VResult<&Ktype> {
        self.get(id).ok_or_else(|| {
            VerifierError::new(
                Reject::ReservedFieldSet,
                insn_idx,
                format!("unknown kernel type id {}", id.0),
            )
        })
    }

    /// Find the struct member covering `[off, off + size)`, requiring the
    /// access to stay inside one member.
    pub fn field_at(&self, id: KtypeId, off: u32, size: u32) -> Option<&KtypeField> {
        let ktype = self.get(id)?;
        let KtypeKind::Struct { fields } = &ktype.kind else {
            return None;
        };
        fields.iter().find(|f| {
            off >= f.offset && off.checked_add(size).is_some_and(|end| end <= f.offset + f.size)
        })
    }

    /// Look up a type id by name.
    pub fn id_by_name(&self, name: &str) -> Option<KtypeId> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| KtypeId(i as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_db() -> (KtypeDb, KtypeId, KtypeId) {
        let mut db = KtypeDb::new();
        let inner = db.register(Ktype {
            name: "task_ctx".into(),
            size: 16,
            kind: KtypeKind::Struct { fields: vec![] },
        });
        let outer = db.register(Ktype {
            name: "task".into(),
            size: 24,
            kind: KtypeKind::Struct {
                fields: vec![
                    KtypeField {
                        name: "pid".into(),
                        offset: 0,
                        size: 4,
                        kind: KtypeFieldKind::Scalar,
                    },
                    KtypeField {
                        name: "ctx".into(),
                        offset: 8,
                        size: 8,
                        kind: KtypeFieldKind::Ptr {
                            target: inner,
                            tag: PtrTag {
                                rcu: true,
                                trusted: false,
                                maybe_null: true,
                            },
                        },
                    },
                ],
            },
        });
        (db, inner, outer)
    }

    #[test]
    fn field_lookup_respects_bounds() {
        let (db, _, outer) = sample_db();
        assert_eq!(db.field_at(outer, 0, 4).unwrap().name, "pid");
        assert_eq!(db.field_at(outer, 8, 8).unwrap().name, "ctx");
        // straddles two members
        assert!(db.field_at(outer, 2, 8).is_none());
        // past the end
        assert!(db.field_at(outer, 20, 8).is_none());
    }

    #[test]
    fn name_lookup() {
        let (db, inner, _) = sample_db();
        assert_eq!(db.id_by_name("task_ctx"), Some(inner));
        assert_eq!(db.id_by_name("absent"), None);
    }
}
