//! The value model: tagged values, shared string and array handles with
//! explicit reference counts, mapping mechanics, and the string hash table.
//!
//! Everything heap-resident here is allocated from the [`heap`] crate's
//! pools. Handles are plain `NonNull` pointers carried inside [`Value`];
//! the reference-count discipline is explicit — whoever stores a handle
//! takes a reference, whoever drops a stored handle releases one.

mod array;
mod hash;
mod str;
mod value;

pub use array::{
    arr_del, arr_grow_insert, arr_new, arr_ref, arr_remove_pair, map_cmp,
    map_search, map_sort, Arr,
};
pub use hash::{hashmem, hashstr, Hashtab};
pub use str::{str_alloc, str_cmp, str_del, str_index, str_new, str_ref, Str};
pub use value::{
    del_value, ref_value, type_name, Flt, Lvalue, Oref, Value, REF_MASK,
    REF_SHIFT, TYPE_MASK, T_ARRAY, T_CLASS, T_FLOAT, T_INT, T_LVALUE,
    T_LWOBJECT, T_MAPPING, T_MIXED, T_NIL, T_OBJECT, T_STRING, T_VOID,
};
