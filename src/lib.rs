#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

use cfg_if::cfg_if;

mod allocator;
mod config;
mod device;
mod diagnostics;
mod error;
mod pool;
mod region;
mod slab;

pub use allocator::SlabAllocator;
pub use config::{AllocatorConfig, ResourceKind, DIAGNOSTICS_ENV_VAR};
pub use device::{
    Device, DeviceError, DeviceLimits, MemoryClass, MemoryProperties, MemoryRequirements,
};
pub use diagnostics::{
    DiagnosticEvent, DiagnosticOp, DiagnosticSink, LogSink, DIAGNOSTICS_TARGET,
};
pub use error::{Error, InvalidRegionReason, Result};
pub use region::{MappedRegion, Region, SlabId};
pub use slab::SlabStats;

cfg_if! {
    if #[cfg(feature = "host")] {
        mod host;
        pub use host::{HostDevice, HostMemory, HostResource};
    }
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be non-zero. It does not need to be a power of two.
/// Returns `None` on overflow.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert_ne!(alignment, 0);
    value.checked_next_multiple_of(alignment)
}
