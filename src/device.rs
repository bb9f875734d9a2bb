//! The device layer that slabs are carved out of.
//!
//! Picking a physical device and talking to the driver is somebody else's job.
//! This crate only needs the handful of entry points in [`Device`]: allocate
//! and free top-level memory objects, map and unmap them, and bind resources to
//! an offset inside one.

use bitflags::bitflags;
use core::{fmt, ptr::NonNull};
use thiserror::Error;

/// An opaque key identifying one of the device's memory types.
///
/// A [`SlabAllocator`](crate::SlabAllocator) keeps one pool of slabs per
/// memory class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryClass(pub u32);

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory class {}", self.0)
    }
}

bitflags! {
    /// Property flags of a device memory type.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        /// Fastest memory for device access. Usually not host visible.
        const DEVICE_LOCAL = 1 << 0;
        /// Can be mapped into the host address space.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes become visible to the device without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// Host reads are cached.
        const HOST_CACHED = 1 << 3;
        /// Backing storage may be committed lazily by the implementation.
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

/// What the device says a specific resource needs from the memory it is bound
/// to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    /// Size of the region, in bytes.
    pub size: u64,
    /// Required alignment of the region's start offset, in bytes.
    pub alignment: u64,
    /// Bit `i` is set when memory type `i` may back this resource.
    pub type_bits: u32,
}

/// Device limits relevant to sub-allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// The maximum number of top-level allocations that may be live at once.
    pub max_allocation_count: u32,
    /// Every slab size is rounded up to a multiple of this.
    pub min_allocation_granularity: u64,
}

/// An error reported by a [`Device`] implementation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceError {
    /// The host ran out of memory.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// The device ran out of memory.
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// The memory object could not be mapped.
    #[error("memory map failed")]
    MemoryMapFailed,
    /// The resource cannot be bound at the requested offset, or was already
    /// bound.
    #[error("invalid resource binding")]
    InvalidResourceBinding,
    /// The device was lost.
    #[error("device lost")]
    DeviceLost,
}

/// The low-level device API that slabs are allocated from.
///
/// Implementations wrap a real graphics device (or, for [`HostDevice`], plain
/// host memory). All methods take `&self`: the allocator calls into the device
/// from whatever thread is allocating.
///
/// [`HostDevice`]: crate::HostDevice
pub trait Device {
    /// A top-level memory object, i.e. the raw handle backing one slab.
    type Memory;

    /// A resource (buffer, image, ...) that can be bound to memory.
    type Resource: ?Sized;

    /// The limits of this device.
    fn limits(&self) -> DeviceLimits;

    /// The property flags of each memory type, indexed by memory type.
    fn memory_types(&self) -> &[MemoryProperties];

    /// The memory requirements of the given resource.
    fn requirements(&self, resource: &Self::Resource) -> MemoryRequirements;

    /// Allocate a new top-level memory object of `size` bytes.
    ///
    /// This is the expensive call the whole crate exists to avoid making
    /// often.
    fn allocate_memory(&self, class: MemoryClass, size: u64) -> Result<Self::Memory, DeviceError>;

    /// Return a memory object to the device.
    ///
    /// # Safety
    ///
    /// The memory must have been allocated by this device, must not be mapped,
    /// and nothing may use it afterwards.
    unsafe fn free_memory(&self, memory: Self::Memory);

    /// Map the first `size` bytes of the memory object into the host address
    /// space.
    ///
    /// # Safety
    ///
    /// The memory must have been allocated by this device with at least `size`
    /// bytes from a host-visible memory type, and must not currently be
    /// mapped.
    unsafe fn map_memory(
        &self,
        memory: &Self::Memory,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// Unmap a memory object previously mapped with [`Device::map_memory`].
    ///
    /// # Safety
    ///
    /// The memory must currently be mapped, and no pointer derived from the
    /// mapping may be used afterwards.
    unsafe fn unmap_memory(&self, memory: &Self::Memory) -> Result<(), DeviceError>;

    /// Bind `resource` to `memory` at byte `offset`.
    ///
    /// # Safety
    ///
    /// `offset` and the resource's size must lie within the memory object and
    /// satisfy the resource's alignment requirement, and that range must not
    /// be used by anything else while the resource is bound there.
    unsafe fn bind_resource(
        &self,
        resource: &Self::Resource,
        memory: &Self::Memory,
        offset: u64,
    ) -> Result<(), DeviceError>;
}
