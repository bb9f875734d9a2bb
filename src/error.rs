use crate::{DeviceError, MemoryClass, MemoryProperties, Region, SlabId};
use thiserror::Error;

/// Result type local to this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can happen while allocating, freeing, or mapping regions.
///
/// None of these are retried internally. Each one is either irrecoverable
/// resource exhaustion or a caller breaking the usage contract, and carries
/// enough context (allocation tag, slab identity) to triage it.
#[derive(Debug, Error)]
pub enum Error {
    /// No existing slab could satisfy the request and the device's maximum
    /// number of live allocations has been reached.
    #[error(
        "allocation '{tag}' exhausted {memory_class}: \
         {live_slabs} of {max_slabs} device allocations already live"
    )]
    AllocationExhausted {
        /// The tag of the failed allocation.
        tag: String,
        /// The memory class the allocation was routed to.
        memory_class: MemoryClass,
        /// Live slabs across all memory classes.
        live_slabs: usize,
        /// The device's limit.
        max_slabs: usize,
    },

    /// A region was used with a slab that does not own it, freed twice, or
    /// otherwise misused.
    #[error("invalid region {region}: {reason}")]
    InvalidRegion {
        /// The offending region.
        region: Region,
        /// What was wrong with it.
        reason: InvalidRegionReason,
    },

    /// The device failed to map or unmap a slab.
    #[error("failed to map or unmap {slab} ({memory_class})")]
    MappingFailure {
        /// The slab being mapped.
        slab: SlabId,
        /// The slab's memory class.
        memory_class: MemoryClass,
        /// The device's error.
        #[source]
        source: DeviceError,
    },

    /// The device has no memory type that is both allowed by the resource and
    /// has the requested properties.
    #[error(
        "allocation '{tag}' has no memory type in {type_bits:#b} with properties {properties:?}"
    )]
    NoCompatibleMemoryType {
        /// The tag of the failed allocation.
        tag: String,
        /// The resource's compatible memory types.
        type_bits: u32,
        /// The requested properties.
        properties: MemoryProperties,
    },

    /// The device refused to create a new slab.
    #[error("allocation '{tag}' failed to create a {size} byte slab in {memory_class}")]
    SlabCreation {
        /// The tag of the failed allocation.
        tag: String,
        /// The memory class of the slab.
        memory_class: MemoryClass,
        /// Requested slab size.
        size: u64,
        /// The device's error.
        #[source]
        source: DeviceError,
    },

    /// The device refused to bind a resource to its region.
    #[error("allocation '{tag}' failed to bind its resource to {region}")]
    ResourceBinding {
        /// The tag of the failed allocation.
        tag: String,
        /// The region the resource was to be bound to. Already freed again.
        region: Region,
        /// The device's error.
        #[source]
        source: DeviceError,
    },

    /// A zero-sized region was requested.
    #[error("allocation '{tag}' requested zero bytes")]
    EmptyRequest {
        /// The tag of the failed allocation.
        tag: String,
    },

    /// A zero alignment was requested.
    #[error("allocation '{tag}' requested an alignment of {alignment}")]
    InvalidAlignment {
        /// The tag of the failed allocation.
        tag: String,
        /// The requested alignment.
        alignment: u64,
    },
}

/// Why a region was rejected.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InvalidRegionReason {
    /// The region names a slab this allocator never created.
    #[error("no such slab")]
    UnknownSlab,
    /// The region is not currently allocated in its slab: it was already
    /// freed, or never came from this allocator.
    #[error("not allocated in its slab")]
    NotAllocated,
    /// The region was unbound without an outstanding bind.
    #[error("not bound")]
    NotBound,
    /// The region's width is not a multiple of the element size, or its
    /// mapping is not aligned for the element type.
    #[error("width is not a whole number of {elem_size} byte elements aligned to {elem_align}")]
    IncompatibleView {
        /// Size of the requested element type.
        elem_size: usize,
        /// Alignment of the requested element type.
        elem_align: usize,
    },
}

impl Error {
    pub(crate) fn invalid_region(region: Region, reason: InvalidRegionReason) -> Self {
        Error::InvalidRegion { region, reason }
    }
}
