//! Typed kernel functions.
//!
//! Unlike helpers, these are called by identity and their contracts come
//! from kernel type information. They carry the richer argument kinds:
//! allocated objects, refcounted pointers, graph-collection roots and
//! nodes, and iterator slots, plus per-function state transitions such as
//! the RCU bracket toggles.

use crate::reg::IterKind;

bitflags::bitflags! {
    /// Contract flags of a kernel function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KfuncFlags: u16 {
        /// The return value carries a fresh reference.
        const ACQUIRE = 1 << 0;
        /// One argument's reference is consumed.
        const RELEASE = 1 << 1;
        /// The returned pointer may be null.
        const RET_NULL = 1 << 2;
        /// Pointer arguments must be trusted.
        const TRUSTED_ARGS = 1 << 3;
        /// Callable only inside an RCU bracket.
        const RCU_PROTECTED = 1 << 4;
        /// Iterator constructor.
        const ITER_NEW = 1 << 5;
        /// Iterator advance.
        const ITER_NEXT = 1 << 6;
        /// Iterator destructor.
        const ITER_DESTROY = 1 << 7;
        /// Requires the lock covering the collection to be held.
        const LOCK_HELD = 1 << 8;
    }
}

/// Kernel function identifiers, the immediate of a kfunc call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(i32)]
pub enum KfuncId {
    /// `obj_new(type_id) -> obj`: allocate a typed object, acquiring.
    ObjNew = 1,
    /// `obj_drop(obj)`: free an allocation, releasing.
    ObjDrop = 2,
    /// `refcount_acquire(obj) -> obj`: bump a shared object's count.
    RefcountAcquire = 3,
    /// `list_push_front(head, node)`: donate the node to the list.
    ListPushFront = 4,
    /// `list_push_back(head, node)`: donate the node to the list.
    ListPushBack = 5,
    /// `list_pop_front(head) -> node_or_null`: take ownership back.
    ListPopFront = 6,
    /// `list_pop_back(head) -> node_or_null`: take ownership back.
    ListPopBack = 7,
    /// `rbtree_add(root, node, less)`: donate the node to the tree.
    RbtreeAdd = 8,
    /// `rbtree_remove(root, node) -> node_or_null`: take ownership back.
    RbtreeRemove = 9,
    /// `rbtree_first(root) -> node_or_null`: peek without ownership.
    RbtreeFirst = 10,
    /// `rcu_read_lock()`: open the RCU bracket.
    RcuReadLock = 11,
    /// `rcu_read_unlock()`: close the RCU bracket.
    RcuReadUnlock = 12,
    /// `iter_num_new(iter, start, end)`: construct a numeric iterator.
    IterNumNew = 13,
    /// `iter_num_next(iter) -> value_or_null`: advance.
    IterNumNext = 14,
    /// `iter_num_destroy(iter)`: destroy.
    IterNumDestroy = 15,
    /// `kptr_xchg(cell, new) -> old_or_null`: swap a kernel pointer cell.
    KptrXchg = 16,
}

impl KfuncId {
    /// Decode a call immediate.
    pub fn from_imm(imm: i32) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|k| *k as i32 == imm)
    }

    /// Name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::ObjNew => "obj_new",
            Self::ObjDrop => "obj_drop",
            Self::RefcountAcquire => "refcount_acquire",
            Self::ListPushFront => "list_push_front",
            Self::ListPushBack => "list_push_back",
            Self::ListPopFront => "list_pop_front",
            Self::ListPopBack => "list_pop_back",
            Self::RbtreeAdd => "rbtree_add",
            Self::RbtreeRemove => "rbtree_remove",
            Self::RbtreeFirst => "rbtree_first",
            Self::RcuReadLock => "rcu_read_lock",
            Self::RcuReadUnlock => "rcu_read_unlock",
            Self::IterNumNew => "iter_num_new",
            Self::IterNumNext => "iter_num_next",
            Self::IterNumDestroy => "iter_num_destroy",
            Self::KptrXchg => "kptr_xchg",
        }
    }

    /// Contract flags.
    pub fn flags(self) -> KfuncFlags {
        use KfuncFlags as F;
        match self {
            Self::ObjNew => F::ACQUIRE,
            Self::ObjDrop => F::RELEASE,
            Self::RefcountAcquire => F::ACQUIRE | F::TRUSTED_ARGS,
            Self::ListPushFront | Self::ListPushBack | Self::RbtreeAdd => {
                F::RELEASE | F::LOCK_HELD
            }
            Self::ListPopFront | Self::ListPopBack | Self::RbtreeRemove => {
                F::ACQUIRE | F::RET_NULL | F::LOCK_HELD
            }
            Self::RbtreeFirst => F::RET_NULL | F::LOCK_HELD,
            Self::RcuReadLock | Self::RcuReadUnlock => F::empty(),
            Self::IterNumNew => F::ITER_NEW,
            Self::IterNumNext => F::ITER_NEXT | F::RET_NULL,
            Self::IterNumDestroy => F::ITER_DESTROY,
            Self::KptrXchg => F::ACQUIRE | F::RET_NULL,
        }
    }

    /// Whether this is an iterator-advance call, for the loop pass.
    pub fn is_iter_next(self) -> bool {
        self.flags().contains(KfuncFlags::ITER_NEXT)
    }

    /// Iterator family of the iterator kfuncs.
    pub const fn iter_kind(self) -> Option<IterKind> {
        match self {
            Self::IterNumNew | Self::IterNumNext | Self::IterNumDestroy => {
                Some(IterKind::Num)
            }
            _ => None,
        }
    }

    /// Whether the call is tolerated while a spinlock is held. Only the
    /// graph-collection surface is; anything else could sleep or recurse.
    pub fn allowed_with_lock(self) -> bool {
        self.flags().contains(KfuncFlags::LOCK_HELD)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn imm_roundtrip() {
        for kfunc in KfuncId::iter() {
            assert_eq!(KfuncId::from_imm(kfunc as i32), Some(kfunc));
        }
        assert_eq!(KfuncId::from_imm(0), None);
    }

    #[test]
    fn acquire_release_symmetry() {
        // Collection pushes consume ownership, pops return it.
        assert!(KfuncId::ListPushFront.flags().contains(KfuncFlags::RELEASE));
        assert!(KfuncId::ListPopFront.flags().contains(KfuncFlags::ACQUIRE));
        assert!(KfuncId::RbtreeAdd.flags().contains(KfuncFlags::RELEASE));
        assert!(KfuncId::RbtreeRemove.flags().contains(KfuncFlags::ACQUIRE));
    }

    #[test]
    fn iter_family() {
        assert!(KfuncId::IterNumNext.is_iter_next());
        assert!(!KfuncId::IterNumNew.is_iter_next());
        assert_eq!(KfuncId::IterNumNew.iter_kind(), Some(IterKind::Num));
        assert_eq!(KfuncId::ObjNew.iter_kind(), None);
    }
}
