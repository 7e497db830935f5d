mod object;

pub use object::ElfLoad;
pub use object::ObjectFile;
