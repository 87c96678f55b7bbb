//! Concrete filters: chain layers that sit between the client boundary and
//! the plugin. Each one is a minimal, independently useful example of the
//! override patterns described in §4.1: capability-only overrides
//! ([`readonly`], [`rotational`]), a shared-process-state layer that
//! exercises the thread-model tightening rule of §4.3 ([`shared_handle`]),
//! and the two illustrative "hard subsystem" layers from §4.5 and §4.6.

pub mod indexed_decompress;
pub mod readonly;
pub mod remap;
pub mod rotational;
pub mod shared_handle;

pub use indexed_decompress::IndexedDecompressFilter;
pub use readonly::ReadOnlyFilter;
pub use remap::RemapFilter;
pub use rotational::RotationalFilter;
pub use shared_handle::SharedHandleFilter;
