//! Field-offset bootstrap for opaque JVM objects.
//!
//! HotSpot publishes `gHotSpotVMStructs`, a table describing the layout
//! of its internal types, so tools can walk runtime objects without
//! compiling against version-specific headers. Three offsets matter
//! here: where a `Klass` keeps the pointer to its interned name, and
//! where a `Symbol` keeps its length and UTF-8 body.

use std::ffi::CStr;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{debug, warn};

use crate::code_cache::NativeCodeCache;

static KLASS_NAME_OFFSET: AtomicI32 = AtomicI32::new(-1);
static SYMBOL_LENGTH_OFFSET: AtomicI32 = AtomicI32::new(-1);
static SYMBOL_BODY_OFFSET: AtomicI32 = AtomicI32::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VMOffsets {
    pub klass_name: i32,
    pub symbol_length: i32,
    pub symbol_body: i32,
}

impl Default for VMOffsets {
    fn default() -> Self {
        VMOffsets {
            klass_name: -1,
            symbol_length: -1,
            symbol_body: -1,
        }
    }
}

impl VMOffsets {
    fn complete(&self) -> bool {
        self.klass_name >= 0 && self.symbol_length >= 0 && self.symbol_body >= 0
    }
}

/// Walks the published VM-structure table and records the offsets this
/// crate needs. Returns whether all of them were found.
pub fn init(libjvm: &NativeCodeCache) -> bool {
    let symbols = [
        "gHotSpotVMStructs",
        "gHotSpotVMStructEntryArrayStride",
        "gHotSpotVMStructEntryTypeNameOffset",
        "gHotSpotVMStructEntryFieldNameOffset",
        "gHotSpotVMStructEntryOffsetOffset",
    ];

    let mut values = [0usize; 5];
    for (value, name) in values.iter_mut().zip(symbols) {
        let Some(address) = libjvm.find_symbol(name) else {
            warn!("VM structure symbol {} not found", name);
            return false;
        };
        // Each symbol is a variable holding one machine word.
        *value = unsafe { *(address as *const usize) };
    }
    let [entry, stride, type_offset, field_offset, offset_offset] = values;

    let offsets = unsafe { scan(entry, stride, type_offset, field_offset, offset_offset) };
    set_offsets(offsets);
    debug!("VM structure offsets: {:?}", offsets);
    offsets.complete()
}

/// Iterates table entries of `stride` bytes starting at `entry` until the
/// null type/field sentinel, collecting the offsets of `Klass._name`,
/// `Symbol._length` and `Symbol._body`.
///
/// # Safety
///
/// `entry` must point at a well-formed table: every entry up to the
/// sentinel holds readable C-string pointers at `type_offset` and
/// `field_offset` and a word-sized offset at `offset_offset`.
pub unsafe fn scan(
    mut entry: usize,
    stride: usize,
    type_offset: usize,
    field_offset: usize,
    offset_offset: usize,
) -> VMOffsets {
    let mut offsets = VMOffsets::default();
    if entry == 0 || stride == 0 {
        return offsets;
    }

    loop {
        let type_name = *((entry + type_offset) as *const *const libc::c_char);
        let field_name = *((entry + field_offset) as *const *const libc::c_char);
        if type_name.is_null() || field_name.is_null() {
            break;
        }

        let offset = *((entry + offset_offset) as *const u64) as i32;
        match (
            CStr::from_ptr(type_name).to_bytes(),
            CStr::from_ptr(field_name).to_bytes(),
        ) {
            (b"Klass", b"_name") => offsets.klass_name = offset,
            (b"Symbol", b"_length") => offsets.symbol_length = offset,
            (b"Symbol", b"_body") => offsets.symbol_body = offset,
            _ => {}
        }

        entry += stride;
    }

    offsets
}

pub(crate) fn set_offsets(offsets: VMOffsets) {
    KLASS_NAME_OFFSET.store(offsets.klass_name, Ordering::Release);
    SYMBOL_LENGTH_OFFSET.store(offsets.symbol_length, Ordering::Release);
    SYMBOL_BODY_OFFSET.store(offsets.symbol_body, Ordering::Release);
}

pub fn available() -> bool {
    klass_name_offset() >= 0 && symbol_length_offset() >= 0 && symbol_body_offset() >= 0
}

pub fn klass_name_offset() -> i32 {
    KLASS_NAME_OFFSET.load(Ordering::Acquire)
}

pub fn symbol_length_offset() -> i32 {
    SYMBOL_LENGTH_OFFSET.load(Ordering::Acquire)
}

pub fn symbol_body_offset() -> i32 {
    SYMBOL_BODY_OFFSET.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::mem::offset_of;
    use std::ptr;

    #[repr(C)]
    struct Entry {
        type_name: *const libc::c_char,
        field_name: *const libc::c_char,
        offset: u64,
    }

    struct Table {
        entries: Vec<Entry>,
        // Keeps the strings the entries point into alive.
        _strings: Vec<CString>,
    }

    fn table(rows: &[(&str, &str, u64)]) -> Table {
        let mut strings = Vec::new();
        let mut entries = Vec::new();
        for (type_name, field_name, offset) in rows {
            let type_name = CString::new(*type_name).unwrap();
            let field_name = CString::new(*field_name).unwrap();
            entries.push(Entry {
                type_name: type_name.as_ptr(),
                field_name: field_name.as_ptr(),
                offset: *offset,
            });
            strings.push(type_name);
            strings.push(field_name);
        }
        entries.push(Entry {
            type_name: ptr::null(),
            field_name: ptr::null(),
            offset: 0,
        });
        Table {
            entries,
            _strings: strings,
        }
    }

    fn scan_table(table: &Table) -> VMOffsets {
        unsafe {
            scan(
                table.entries.as_ptr() as usize,
                std::mem::size_of::<Entry>(),
                offset_of!(Entry, type_name),
                offset_of!(Entry, field_name),
                offset_of!(Entry, offset),
            )
        }
    }

    #[test]
    fn offsets_are_collected_up_to_the_sentinel() {
        let table = table(&[
            ("Klass", "_layout_helper", 12),
            ("Klass", "_name", 16),
            ("Symbol", "_length", 6),
            ("Symbol", "_body", 8),
            ("Method", "_constMethod", 8),
        ]);
        assert_eq!(
            scan_table(&table),
            VMOffsets {
                klass_name: 16,
                symbol_length: 6,
                symbol_body: 8,
            }
        );
    }

    #[test]
    fn missing_fields_leave_offsets_unset() {
        let table = table(&[("Klass", "_name", 16)]);
        let offsets = scan_table(&table);
        assert_eq!(offsets.klass_name, 16);
        assert_eq!(offsets.symbol_length, -1);
        assert_eq!(offsets.symbol_body, -1);
        assert!(!offsets.complete());
    }

    #[test]
    fn null_table_or_stride_yields_nothing() {
        let offsets = unsafe { scan(0, 24, 0, 8, 16) };
        assert_eq!(offsets, VMOffsets::default());

        let table = table(&[("Klass", "_name", 16)]);
        let offsets = unsafe { scan(table.entries.as_ptr() as usize, 0, 0, 8, 16) };
        assert_eq!(offsets, VMOffsets::default());
    }
}
