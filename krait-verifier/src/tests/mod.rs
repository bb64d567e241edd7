//! End-to-end verification scenarios driven through the public surface.

mod basic;
mod bounds_tracking;
mod calls;
mod loops;
mod refs;

use crate::map::{
    FieldKind,
    MapDef,
    MapKind,
    TypedField,
};

/// A lockable hash map: a spin lock word at offset 0, data after it.
fn lockable_map() -> MapDef {
    let mut map = MapDef::plain("locked", MapKind::Hash, 4, 16);
    map.fields.push(TypedField {
        offset: 0,
        kind: FieldKind::SpinLock,
    });
    map
}

/// A frozen array map exposing constant data.
fn frozen_array(data: Vec<u8>) -> MapDef {
    let value_size = data.len() as u32;
    let mut map = MapDef::plain("rodata", MapKind::Array, 4, value_size);
    map.frozen = true;
    map.rdonly_data = Some(data);
    map
}
