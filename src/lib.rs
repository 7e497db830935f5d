//! In-process heap-allocation tracer for the HotSpot JVM.
//!
//! Instead of going through JVMTI or JFR, the tracer plants hardware
//! breakpoints on HotSpot's internal allocation-notification functions
//! and decodes each trap's register file into an allocation sample. See
//! [`alloc_tracer`] for the lifecycle and [`vm_structs`] for the
//! version-robust field-offset bootstrap it depends on.

pub mod alloc_tracer;
pub mod arch;
pub mod code_cache;
pub mod signals;
pub mod stack_frame;
pub mod trap;
pub mod util;
pub mod vm_structs;
