//! A [`Device`] backed by ordinary host memory.

use crate::{
    Device, DeviceError, DeviceLimits, MemoryClass, MemoryProperties, MemoryRequirements,
};
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        OnceLock,
    },
};

/// Alignment of every host memory object.
const HOST_MEMORY_ALIGN: usize = 4096;

/// A [`Device`] whose "device memory" is zeroed host memory from the global
/// allocator.
///
/// It behaves like a strict driver: mapping an already-mapped object, unmapping
/// an unmapped one, or binding a resource twice are all errors. It also counts
/// the calls made into it, so tests can observe exactly when slabs are
/// created, mapped, and unmapped.
#[derive(Debug)]
pub struct HostDevice {
    limits: DeviceLimits,
    memory_types: Vec<MemoryProperties>,
    live_allocations: AtomicUsize,
    map_calls: AtomicUsize,
    unmap_calls: AtomicUsize,
    fail_next_map: AtomicBool,
    fail_next_unmap: AtomicBool,
}

impl Default for HostDevice {
    /// 4096 allocations at a 1 KiB granularity, with three memory types:
    /// device-local, host-visible coherent, and host-visible coherent cached.
    fn default() -> Self {
        HostDevice::new(
            DeviceLimits {
                max_allocation_count: 4096,
                min_allocation_granularity: 1024,
            },
            vec![
                MemoryProperties::DEVICE_LOCAL,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
                MemoryProperties::HOST_VISIBLE
                    | MemoryProperties::HOST_COHERENT
                    | MemoryProperties::HOST_CACHED,
            ],
        )
    }
}

impl HostDevice {
    /// Create a host device with the given limits and memory types.
    pub fn new(limits: DeviceLimits, memory_types: Vec<MemoryProperties>) -> Self {
        HostDevice {
            limits,
            memory_types,
            live_allocations: AtomicUsize::new(0),
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
            fail_next_map: AtomicBool::new(false),
            fail_next_unmap: AtomicBool::new(false),
        }
    }

    /// Number of memory objects currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::SeqCst)
    }

    /// Number of successful `map_memory` calls so far.
    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::SeqCst)
    }

    /// Number of successful `unmap_memory` calls so far.
    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::SeqCst)
    }

    /// Make the next `map_memory` call fail with
    /// [`DeviceError::MemoryMapFailed`].
    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::SeqCst);
    }

    /// Make the next `unmap_memory` call report
    /// [`DeviceError::MemoryMapFailed`]. The memory is left unmapped anyway,
    /// like a driver that tears the mapping down before noticing a problem.
    pub fn fail_next_unmap(&self) {
        self.fail_next_unmap.store(true, Ordering::SeqCst);
    }
}

/// A memory object allocated by a [`HostDevice`].
#[derive(Debug)]
pub struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
    mapped: AtomicBool,
}

// Safety: `HostMemory` owns its allocation, and the only shared mutable state
// is the atomic `mapped` flag. Access to the bytes themselves goes through the
// pointer returned by mapping, whose use is the caller's responsibility.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    /// Size of the memory object, in bytes.
    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }
}

/// A resource that can be bound to a [`HostDevice`]'s memory.
#[derive(Debug)]
pub struct HostResource {
    requirements: MemoryRequirements,
    offset: OnceLock<u64>,
}

impl HostResource {
    /// A resource with the given requirements.
    pub fn new(requirements: MemoryRequirements) -> Self {
        HostResource {
            requirements,
            offset: OnceLock::new(),
        }
    }

    /// The offset this resource was bound at, if it has been bound.
    pub fn bound_offset(&self) -> Option<u64> {
        self.offset.get().copied()
    }
}

impl Device for HostDevice {
    type Memory = HostMemory;
    type Resource = HostResource;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn memory_types(&self) -> &[MemoryProperties] {
        &self.memory_types
    }

    fn requirements(&self, resource: &HostResource) -> MemoryRequirements {
        resource.requirements
    }

    fn allocate_memory(
        &self,
        class: MemoryClass,
        size: u64,
    ) -> Result<HostMemory, DeviceError> {
        let size = usize::try_from(size).map_err(|_| DeviceError::OutOfHostMemory)?;
        if size == 0 {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        let layout = Layout::from_size_align(size, HOST_MEMORY_ALIGN)
            .map_err(|_| DeviceError::OutOfHostMemory)?;

        // Safety: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(DeviceError::OutOfHostMemory)?;

        self.live_allocations.fetch_add(1, Ordering::SeqCst);
        log::trace!("host device: allocated {size} bytes at {ptr:p} for {class}");
        Ok(HostMemory {
            ptr,
            layout,
            mapped: AtomicBool::new(false),
        })
    }

    unsafe fn free_memory(&self, memory: HostMemory) {
        debug_assert!(!memory.mapped.load(Ordering::SeqCst));
        log::trace!("host device: freeing {:p}", memory.ptr);
        std::alloc::dealloc(memory.ptr.as_ptr(), memory.layout);
        self.live_allocations.fetch_sub(1, Ordering::SeqCst);
    }

    unsafe fn map_memory(
        &self,
        memory: &HostMemory,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        if self.fail_next_map.swap(false, Ordering::SeqCst) || size > memory.size() {
            return Err(DeviceError::MemoryMapFailed);
        }
        if memory.mapped.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::MemoryMapFailed);
        }
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        Ok(memory.ptr)
    }

    unsafe fn unmap_memory(&self, memory: &HostMemory) -> Result<(), DeviceError> {
        if !memory.mapped.swap(false, Ordering::SeqCst)
            || self.fail_next_unmap.swap(false, Ordering::SeqCst)
        {
            return Err(DeviceError::MemoryMapFailed);
        }
        self.unmap_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    unsafe fn bind_resource(
        &self,
        resource: &HostResource,
        memory: &HostMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let requirements = resource.requirements;
        let fits = offset
            .checked_add(requirements.size)
            .is_some_and(|end| end <= memory.size());
        let aligned = requirements.alignment != 0 && offset % requirements.alignment == 0;
        if !fits || !aligned {
            return Err(DeviceError::InvalidResourceBinding);
        }
        resource
            .offset
            .set(offset)
            .map_err(|_| DeviceError::InvalidResourceBinding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mapping() {
        let device = HostDevice::default();
        let memory = device.allocate_memory(MemoryClass(1), 4096).unwrap();
        assert_eq!(device.live_allocations(), 1);
        unsafe {
            let ptr = device.map_memory(&memory, 4096).unwrap();
            assert_eq!(ptr.as_ptr() as usize % HOST_MEMORY_ALIGN, 0);
            assert_eq!(device.map_memory(&memory, 4096), Err(DeviceError::MemoryMapFailed));
            device.unmap_memory(&memory).unwrap();
            assert_eq!(device.unmap_memory(&memory), Err(DeviceError::MemoryMapFailed));
            assert_eq!(device.map_memory(&memory, 8192), Err(DeviceError::MemoryMapFailed));
            device.free_memory(memory);
        }
        assert_eq!(device.live_allocations(), 0);
        assert_eq!((device.map_calls(), device.unmap_calls()), (1, 1));
    }

    #[test]
    fn resources_bind_once_in_bounds() {
        let device = HostDevice::default();
        let memory = device.allocate_memory(MemoryClass(0), 1024).unwrap();
        let requirements = MemoryRequirements {
            size: 256,
            alignment: 256,
            type_bits: 1,
        };
        let resource = HostResource::new(requirements);
        unsafe {
            assert!(device.bind_resource(&resource, &memory, 128).is_err());
            assert!(device.bind_resource(&resource, &memory, 1024).is_err());
            device.bind_resource(&resource, &memory, 768).unwrap();
            assert!(device.bind_resource(&resource, &memory, 0).is_err());
            device.free_memory(memory);
        }
        assert_eq!(resource.bound_offset(), Some(768));
    }

    #[test]
    fn zero_sized_memory_is_refused() {
        let device = HostDevice::default();
        assert_eq!(
            device.allocate_memory(MemoryClass(0), 0).unwrap_err(),
            DeviceError::OutOfDeviceMemory
        );
    }
}
