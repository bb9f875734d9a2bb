//! Pools group the slabs of one memory class.

use crate::{
    align_up,
    slab::{
        sync::{Mutex, RwLock},
        Slab,
    },
    Device, DeviceError, Error, MemoryClass, Region, Result, SlabId,
};
use std::sync::Arc;

/// One allocation request, as seen by a pool.
pub(crate) struct Request<'a> {
    pub(crate) tag: &'a Arc<str>,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    /// Slab-size hint used when a new slab has to be created.
    pub(crate) block_size: u64,
}

/// Every slab an allocator has created, across all memory classes, indexed by
/// [`SlabId`].
///
/// Slabs are only ever appended, so the table's length is also the number of
/// live top-level device allocations.
pub(crate) struct SlabTable<M> {
    slabs: RwLock<Vec<Arc<Slab<M>>>>,
    // Serializes the check against the device's allocation limit with the
    // creation it guards.
    creating: Mutex<()>,
}

impl<M> Default for SlabTable<M> {
    fn default() -> Self {
        SlabTable {
            slabs: RwLock::new(Vec::new()),
            creating: Mutex::new(()),
        }
    }
}

impl<M> SlabTable<M> {
    pub(crate) fn get(&self, id: SlabId) -> Option<Arc<Slab<M>>> {
        self.slabs.read().get(id.index()).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.slabs.read().len()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Slab<M>>> {
        self.slabs.read().clone()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Arc<Slab<M>>> {
        std::mem::take(&mut *self.slabs.write())
    }

    /// Allocate a new slab of `size` bytes from the device and register it.
    fn create<D>(
        &self,
        device: &D,
        memory_class: MemoryClass,
        size: u64,
        tag: &str,
    ) -> Result<Arc<Slab<M>>>
    where
        D: Device<Memory = M>,
    {
        let _creating = self.creating.lock();

        let live_slabs = self.len();
        let max_slabs = device.limits().max_allocation_count as usize;
        if live_slabs >= max_slabs {
            return Err(Error::AllocationExhausted {
                tag: tag.to_string(),
                memory_class,
                live_slabs,
                max_slabs,
            });
        }

        let memory = device
            .allocate_memory(memory_class, size)
            .map_err(|source| Error::SlabCreation {
                tag: tag.to_string(),
                memory_class,
                size,
                source,
            })?;

        let mut slabs = self.slabs.write();
        let id = SlabId(slabs.len());
        log::debug!(
            "created {id} in {memory_class}: {size} bytes for '{tag}' \
             ({} of {max_slabs} device allocations)",
            id.index() + 1,
        );
        let slab = Arc::new(Slab::new(id, memory_class, size, memory));
        slabs.push(slab.clone());
        Ok(slab)
    }
}

/// The slabs of a single memory class, in creation order.
pub(crate) struct Pool<M> {
    memory_class: MemoryClass,
    slabs: RwLock<Vec<Arc<Slab<M>>>>,
}

impl<M> Pool<M> {
    pub(crate) fn new(memory_class: MemoryClass) -> Self {
        Pool {
            memory_class,
            slabs: RwLock::new(Vec::new()),
        }
    }

    /// Allocate a region from the first slab that can fit it, creating a new
    /// slab when none can.
    pub(crate) fn allocate<D>(
        &self,
        device: &D,
        table: &SlabTable<M>,
        request: &Request<'_>,
    ) -> Result<Region>
    where
        D: Device<Memory = M>,
    {
        if let Some(region) = self.try_existing(&self.slabs.read(), request) {
            return Ok(region);
        }

        let mut slabs = self.slabs.write();

        // Another thread may have freed space or added a slab while we waited
        // for the write lock.
        if let Some(region) = self.try_existing(&slabs, request) {
            return Ok(region);
        }

        let granularity = device.limits().min_allocation_granularity.max(1);
        let size = slab_size(request.size, request.block_size, granularity).ok_or_else(|| {
            Error::SlabCreation {
                tag: request.tag.to_string(),
                memory_class: self.memory_class,
                size: request.size,
                source: DeviceError::OutOfDeviceMemory,
            }
        })?;

        let slab = table.create(device, self.memory_class, size, request.tag)?;
        slabs.push(slab.clone());

        let region = slab
            .try_allocate(request.size, request.alignment, request.tag)
            .expect("a fresh slab must fit the request it was sized for");
        Ok(region)
    }

    fn try_existing(&self, slabs: &[Arc<Slab<M>>], request: &Request<'_>) -> Option<Region> {
        slabs
            .iter()
            .find_map(|slab| slab.try_allocate(request.size, request.alignment, request.tag))
    }
}

/// The size of a new slab: the request or the creation hint, whichever is
/// larger, rounded up to the device's allocation granularity.
fn slab_size(size: u64, block_size: u64, granularity: u64) -> Option<u64> {
    let size = align_up(size, granularity)?;
    let block_size = align_up(block_size, granularity)?;
    Some(size.max(block_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_size_rounds_to_granularity() {
        assert_eq!(slab_size(1, 0, 1024), Some(1024));
        assert_eq!(slab_size(1025, 0, 1024), Some(2048));
        assert_eq!(slab_size(100, 5000, 1024), Some(5120));
        assert_eq!(slab_size(9000, 5000, 1024), Some(9216));
        assert_eq!(slab_size(u64::MAX, 0, 1024), None);
    }

    #[cfg(feature = "host")]
    mod host {
        use super::*;
        use crate::{DeviceLimits, HostDevice, HostMemory, MemoryProperties};

        fn device(max_allocation_count: u32) -> HostDevice {
            HostDevice::new(
                DeviceLimits {
                    max_allocation_count,
                    min_allocation_granularity: 256,
                },
                vec![MemoryProperties::HOST_VISIBLE],
            )
        }

        fn request(tag: &Arc<str>, size: u64, alignment: u64, block_size: u64) -> Request<'_> {
            Request {
                tag,
                size,
                alignment,
                block_size,
            }
        }

        fn teardown(
            device: &HostDevice,
            mut table: SlabTable<HostMemory>,
            pool: Pool<HostMemory>,
        ) {
            drop(pool);
            for slab in table.take_all() {
                let slab = Arc::try_unwrap(slab).ok().unwrap();
                unsafe { slab.destroy(device) };
            }
            assert_eq!(device.live_allocations(), 0);
        }

        #[test]
        fn existing_slabs_are_tried_first() {
            let device = device(8);
            let table = SlabTable::default();
            let pool = Pool::new(MemoryClass(0));
            let tag: Arc<str> = Arc::from("buffer");

            let a = pool.allocate(&device, &table, &request(&tag, 100, 1, 1024)).unwrap();
            let b = pool.allocate(&device, &table, &request(&tag, 100, 1, 1024)).unwrap();
            assert_eq!(a.slab(), b.slab());
            assert_eq!(table.len(), 1);
            assert_eq!(table.get(a.slab()).unwrap().stats().capacity, 1024);

            // Too big for what is left of the first slab.
            let c = pool.allocate(&device, &table, &request(&tag, 1000, 1, 0)).unwrap();
            assert_ne!(c.slab(), a.slab());
            assert_eq!(table.get(c.slab()).unwrap().stats().capacity, 1024);

            // Fits in the first slab again.
            let d = pool.allocate(&device, &table, &request(&tag, 500, 1, 0)).unwrap();
            assert_eq!(d.slab(), a.slab());

            teardown(&device, table, pool);
        }

        #[test]
        fn allocation_limit_is_enforced() {
            let device = device(2);
            let table = SlabTable::default();
            let pool = Pool::new(MemoryClass(0));
            let tag: Arc<str> = Arc::from("image");

            pool.allocate(&device, &table, &request(&tag, 256, 1, 0)).unwrap();
            pool.allocate(&device, &table, &request(&tag, 256, 1, 0)).unwrap();
            match pool.allocate(&device, &table, &request(&tag, 256, 1, 0)) {
                Err(Error::AllocationExhausted {
                    tag,
                    live_slabs: 2,
                    max_slabs: 2,
                    ..
                }) => assert_eq!(tag, "image"),
                other => panic!("expected exhaustion, got {other:?}"),
            }
            assert_eq!(device.live_allocations(), 2);

            teardown(&device, table, pool);
        }

        #[test]
        fn oversized_request_is_reported_with_context() {
            let device = device(8);
            let table = SlabTable::default();
            let pool = Pool::new(MemoryClass(0));
            let tag: Arc<str> = Arc::from("huge");

            match pool.allocate(&device, &table, &request(&tag, u64::MAX - 10, 1, 0)) {
                Err(Error::SlabCreation { tag, .. }) => assert_eq!(tag, "huge"),
                other => panic!("expected a slab creation failure, got {other:?}"),
            }
            assert_eq!(table.len(), 0);

            teardown(&device, table, pool);
        }
    }
}
