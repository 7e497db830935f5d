//! Symbol resolution against a shared library loaded in this process.
//!
//! HotSpot's allocation hooks are internal functions whose mangled names
//! end in toolchain-dependent type signatures, so lookups happen both by
//! exact name and by mangled-name prefix. Addresses coming out of the
//! symbol tables are file-relative; the cache translates them into the
//! live mapping using the base address from `/proc/self/maps` and the
//! first loadable segment's geometry.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use procfs::process::{MMapPath, Process};
use tracing::debug;

use tlabtrap_object::ObjectFile;

pub struct NativeCodeCache {
    path: PathBuf,
    base: u64,
    /// Amount to add to a file-relative symbol value to get the address
    /// inside the live mapping.
    bias: u64,
    object: ObjectFile,
}

impl NativeCodeCache {
    pub fn load(path: &Path, base: u64) -> Result<Self> {
        let object = ObjectFile::new(path)?;
        let load = object
            .elf_load_segments()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no loadable segments in {}", path.display()))?;
        // Position-dependent executables are mapped at their link-time
        // addresses; only shared objects need rebasing.
        let bias = if object.is_dynamic() {
            base.wrapping_add(load.p_offset).wrapping_sub(load.p_vaddr)
        } else {
            0
        };

        debug!(
            "code cache for {} at base 0x{:x}, bias 0x{:x}",
            path.display(),
            base,
            bias
        );

        Ok(NativeCodeCache {
            path: path.to_path_buf(),
            base,
            bias,
            object,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Runtime address of an exported or debug symbol with exactly this
    /// name.
    pub fn find_symbol(&self, name: &str) -> Option<usize> {
        self.object
            .symbol_address(name)
            .map(|address| self.bias.wrapping_add(address) as usize)
    }

    /// Runtime address of the first symbol whose name begins with
    /// `prefix`.
    pub fn find_symbol_by_prefix(&self, prefix: &str) -> Option<usize> {
        self.object
            .symbol_address_by_prefix(prefix)
            .map(|address| self.bias.wrapping_add(address) as usize)
    }
}

/// Builds a code cache for a library mapped into this process, matched by
/// file-name prefix ("libc.so" matches "libc.so.6"). The lowest mapping
/// address is the one the symbol values are relative to.
pub fn loaded_library(name: &str) -> Result<NativeCodeCache> {
    let process = Process::myself()?;
    let mut found: Option<(PathBuf, u64)> = None;

    for map in process.maps()? {
        let MMapPath::Path(path) = &map.pathname else {
            continue;
        };
        let matches = path
            .file_name()
            .is_some_and(|f| f.to_string_lossy().starts_with(name));
        if !matches {
            continue;
        }
        match &found {
            Some((_, base)) if *base <= map.address.0 => {}
            _ => found = Some((path.clone(), map.address.0)),
        }
    }

    let (path, base) = found.ok_or_else(|| anyhow!("{name} is not mapped in this process"))?;
    NativeCodeCache::load(&path, base)
}

/// The host JVM's native library.
pub fn jvm_library() -> Result<NativeCodeCache> {
    loaded_library("libjvm.so")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_library_is_an_error() {
        assert!(loaded_library("libdoesnotexist.so").is_err());
    }

    #[test]
    fn jvm_is_not_mapped_in_the_test_binary() {
        assert!(jvm_library().is_err());
    }
}
