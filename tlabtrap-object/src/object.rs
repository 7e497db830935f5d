use std::fs;
use std::path::Path;

use anyhow::Result;
use memmap2::Mmap;

use object::Object;
use object::ObjectKind;
use object::ObjectSegment;
use object::ObjectSymbol;

/// Elf load segments, used to translate file-relative symbol values into
/// addresses inside the live mapping of a shared library.
#[derive(Debug, Clone)]
pub struct ElfLoad {
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_memsz: u64,
}

/// A parsed ELF object backed by a memory map of the file on disk.
///
/// The symbol accessors search the debug symbol table first and fall back
/// to the dynamic one: a JVM's allocation hooks are internal functions
/// that only show up in `.symtab` (when debug symbols are installed),
/// while the exported VM-structure markers live in `.dynsym`.
#[derive(Debug)]
pub struct ObjectFile {
    leaked_mmap_ptr: *const Mmap,
    object: object::File<'static>,
}

impl Drop for ObjectFile {
    fn drop(&mut self) {
        unsafe {
            let _to_free = Box::from_raw(self.leaked_mmap_ptr as *mut Mmap);
        }
    }
}

impl ObjectFile {
    pub fn new(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let leaked: &'static Mmap = Box::leak(Box::new(mmap));
        let object = object::File::parse(&**leaked)?;

        Ok(ObjectFile {
            leaked_mmap_ptr: leaked as *const Mmap,
            object,
        })
    }

    /// Returns the file-relative address of a defined symbol with exactly
    /// this name, or `None`.
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.find_symbol(|candidate| candidate == name)
    }

    /// Returns the file-relative address of the first defined symbol whose
    /// name starts with `prefix`. Mangled C++ names carry type signatures
    /// in their tails that vary across toolchains and releases, so callers
    /// match on the stable mangled prefix.
    pub fn symbol_address_by_prefix(&self, prefix: &str) -> Option<u64> {
        self.find_symbol(|candidate| candidate.starts_with(prefix))
    }

    fn find_symbol(&self, matches: impl Fn(&str) -> bool) -> Option<u64> {
        for symbol in self.object.symbols().chain(self.object.dynamic_symbols()) {
            if !symbol.is_definition() {
                continue;
            }
            if let Ok(name) = symbol.name() {
                if matches(name) {
                    return Some(symbol.address());
                }
            }
        }
        None
    }

    pub fn is_dynamic(&self) -> bool {
        self.object.kind() == ObjectKind::Dynamic
    }

    /// The loadable segments, in file order. For ELF objects the segment
    /// iterator yields exactly the `PT_LOAD` program headers.
    pub fn elf_load_segments(&self) -> Vec<ElfLoad> {
        self.object
            .segments()
            .map(|segment| {
                let (p_offset, _) = segment.file_range();
                ElfLoad {
                    p_offset,
                    p_vaddr: segment.address(),
                    p_memsz: segment.size(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn own_executable() -> ObjectFile {
        ObjectFile::new(&PathBuf::from("/proc/self/exe")).unwrap()
    }

    #[test]
    fn own_symbols_can_be_resolved() {
        // Test binaries keep their symbol table, so `main` must be there.
        let object = own_executable();
        assert!(object.symbol_address("main").is_some());
        assert!(object
            .symbol_address("this_symbol_does_not_exist_anywhere")
            .is_none());
    }

    // Exported so it shows up in the test binary's symbol table under a
    // name no other symbol shares a prefix with.
    #[no_mangle]
    pub extern "C" fn tlabtrap_object_prefix_probe() {}

    #[test]
    fn prefix_resolution_matches_exact_resolution_target() {
        let object = own_executable();
        let exact = object.symbol_address("tlabtrap_object_prefix_probe").unwrap();
        assert_eq!(
            object.symbol_address_by_prefix("tlabtrap_object_prefix_pro"),
            Some(exact)
        );
    }

    #[test]
    fn load_segments_are_present() {
        let object = own_executable();
        let loads = object.elf_load_segments();
        assert!(!loads.is_empty());
        for load in &loads {
            assert!(load.p_memsz > 0);
        }
    }
}
