//! Resolves symbols of the libc mapped into this very test process and
//! cross-checks the addresses against the dynamic linker.

use std::ffi::CString;

use tlabtrap::code_cache::loaded_library;

#[test]
fn libc_symbols_resolve_to_their_runtime_addresses() {
    // The test binary links libc dynamically, so it is always mapped.
    let cache = loaded_library("libc.so").unwrap();

    let resolved = cache.find_symbol("malloc").unwrap();
    let name = CString::new("malloc").unwrap();
    let via_dlsym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    assert_eq!(resolved, via_dlsym as usize);
}

#[test]
fn prefix_resolution_finds_symbols_with_varying_tails() {
    let cache = loaded_library("libc.so").unwrap();

    assert!(cache.find_symbol("gnu_get_libc_versio").is_none());
    assert!(cache
        .find_symbol_by_prefix("gnu_get_libc_versio")
        .is_some());
}

#[test]
fn unknown_symbols_resolve_to_none() {
    let cache = loaded_library("libc.so").unwrap();
    assert!(cache.find_symbol("tlabtrap_no_such_symbol").is_none());
    assert!(cache.find_symbol_by_prefix("tlabtrap_no_such_").is_none());
}
