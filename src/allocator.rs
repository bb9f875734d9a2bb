//! The allocator facade: routes requests to the pool of the right memory
//! class and exposes the region lifecycle to resource owners.

use crate::{
    diagnostics::DiagnosticEvent,
    pool::{Pool, Request, SlabTable},
    slab::{sync::RwLock, Slab, SlabStats},
    AllocatorConfig, Device, DeviceError, DiagnosticOp, DiagnosticSink, Error,
    InvalidRegionReason, LogSink, MappedRegion, MemoryClass, MemoryProperties,
    MemoryRequirements, Region, ResourceKind, Result,
};
use std::{collections::BTreeMap, sync::Arc};

/// A sub-allocator that packs many regions into few device allocations.
///
/// This is the device context object: it owns the device handle, one pool of
/// slabs per memory class, and every slab ever created. Independent allocators
/// share nothing, so tests (or multiple devices) can each have their own.
///
/// All methods take `&self` and may be called from any number of threads at
/// once. Each slab guards its layout with a reader/writer lock and its mapping
/// with a separate mutex, so binding a region does not wait on allocations in
/// the same slab.
///
/// Dropping the allocator returns every slab to the device. Regions still live
/// at that point are reported through `log` and their memory is released
/// anyway.
pub struct SlabAllocator<D>
where
    D: Device,
{
    device: D,
    config: AllocatorConfig,
    sink: Box<dyn DiagnosticSink>,
    pools: RwLock<BTreeMap<MemoryClass, Arc<Pool<D::Memory>>>>,
    slabs: SlabTable<D::Memory>,
}

impl<D> SlabAllocator<D>
where
    D: Device,
{
    /// Create an allocator that sub-allocates from `device`.
    pub fn new(device: D, config: AllocatorConfig) -> Self {
        log::debug!(
            "creating slab allocator: {:?}, {:?}",
            device.limits(),
            config
        );
        SlabAllocator {
            device,
            config,
            sink: Box::new(LogSink),
            pools: RwLock::new(BTreeMap::new()),
            slabs: SlabTable::default(),
        }
    }

    /// Send diagnostic events to `sink` instead of the `log` facade.
    ///
    /// Events are only emitted when [`AllocatorConfig::diagnostics`] is set.
    pub fn with_diagnostic_sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Get a shared reference to the device.
    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    /// This allocator's configuration.
    #[inline]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Pick the memory class for a resource.
    ///
    /// Returns the first memory type that the resource allows (its bit is set
    /// in `type_bits`) and that has every one of the desired `properties`.
    pub fn memory_class_for(
        &self,
        type_bits: u32,
        properties: MemoryProperties,
    ) -> Option<MemoryClass> {
        self.device
            .memory_types()
            .iter()
            .zip(0..u32::BITS)
            .find(|(flags, i)| type_bits >> i & 1 == 1 && flags.contains(properties))
            .map(|(_, i)| MemoryClass(i))
    }

    /// Allocate a region satisfying `requirements` from memory with the given
    /// properties.
    ///
    /// `kind` decides how big a slab to create if no existing slab of the
    /// chosen memory class has room. The `tag` names the allocation in errors,
    /// logs, and diagnostics.
    pub fn allocate(
        &self,
        tag: &str,
        requirements: MemoryRequirements,
        properties: MemoryProperties,
        kind: ResourceKind,
    ) -> Result<Region> {
        let memory_class = self
            .memory_class_for(requirements.type_bits, properties)
            .ok_or_else(|| Error::NoCompatibleMemoryType {
                tag: tag.to_string(),
                type_bits: requirements.type_bits,
                properties,
            })?;
        self.allocate_in(
            tag,
            memory_class,
            requirements.size,
            requirements.alignment,
            kind,
        )
    }

    /// Allocate a region of `size` bytes aligned to `alignment` directly from
    /// the pool of `memory_class`.
    pub fn allocate_in(
        &self,
        tag: &str,
        memory_class: MemoryClass,
        size: u64,
        alignment: u64,
        kind: ResourceKind,
    ) -> Result<Region> {
        if size == 0 {
            return Err(Error::EmptyRequest {
                tag: tag.to_string(),
            });
        }
        if alignment == 0 {
            return Err(Error::InvalidAlignment {
                tag: tag.to_string(),
                alignment,
            });
        }

        let tag: Arc<str> = Arc::from(tag);
        let request = Request {
            tag: &tag,
            size,
            alignment,
            block_size: self.config.block_size(kind),
        };
        let region = self
            .pool(memory_class)
            .allocate(&self.device, &self.slabs, &request)?;

        log::trace!("allocated {region} for '{tag}'");
        self.emit(DiagnosticOp::Allocate, tag, &region);
        Ok(region)
    }

    /// Allocate memory for `resource` and bind the resource to it.
    ///
    /// The resource's requirements are queried from the device. If the device
    /// refuses the binding, the region is freed again before the error is
    /// returned.
    pub fn allocate_for(
        &self,
        tag: &str,
        resource: &D::Resource,
        properties: MemoryProperties,
        kind: ResourceKind,
    ) -> Result<Region> {
        let requirements = self.device.requirements(resource);
        let region = self.allocate(tag, requirements, properties, kind)?;
        let slab = self.slab(&region)?;

        // Safety: the region is live, lies within the slab, and was aligned
        // and sized according to the resource's own requirements.
        let bound = unsafe {
            self.device
                .bind_resource(resource, slab.memory(), region.start())
        };
        if let Err(source) = bound {
            if let Err(e) = self.free(region) {
                log::warn!("failed to free {region} after its bind was refused: {e}");
            }
            return Err(Error::ResourceBinding {
                tag: tag.to_string(),
                region,
                source,
            });
        }
        Ok(region)
    }

    /// Return a region to its slab.
    ///
    /// Any binds the region still holds are released (and reported through
    /// `log`), unmapping the slab if they were the last ones. Freeing a region
    /// that is not live is an [`Error::InvalidRegion`].
    ///
    /// If the device fails to unmap the slab, the region has still been freed
    /// and the slab is treated as unmapped; the failure is returned as
    /// [`Error::MappingFailure`] and the region must not be freed again.
    pub fn free(&self, region: Region) -> Result<()> {
        let slab = self.slab(&region)?;
        let freed = slab.free(&self.device, &region)?;

        let tag = freed.tag;
        if freed.released_binds > 0 {
            log::warn!(
                "freed {region} ('{tag}') with {} outstanding binds",
                freed.released_binds
            );
        }

        log::trace!("freed {region} for '{tag}'");
        self.emit(DiagnosticOp::Free, tag, &region);
        freed.unmapped
    }

    /// Get a host-visible view of a region.
    ///
    /// The first bind in a slab maps the whole slab; later binds of any region
    /// in the same slab share that mapping. The mapping is released when every
    /// bind has been matched by an [`unbind`](Self::unbind).
    pub fn bind(&self, region: &Region) -> Result<MappedRegion> {
        let slab = self.slab(region)?;
        let tag = slab
            .live_tag(region)
            .ok_or_else(|| Error::invalid_region(*region, InvalidRegionReason::NotAllocated))?;

        let host_visible = self
            .device
            .memory_types()
            .get(slab.memory_class().0 as usize)
            .is_some_and(|flags| flags.contains(MemoryProperties::HOST_VISIBLE));
        if !host_visible {
            return Err(Error::MappingFailure {
                slab: slab.id(),
                memory_class: slab.memory_class(),
                source: DeviceError::MemoryMapFailed,
            });
        }

        let mapped = slab.bind(&self.device, region, tag.clone())?;
        self.emit(DiagnosticOp::Bind, tag, region);
        Ok(mapped)
    }

    /// Release one bind of a region.
    pub fn unbind(&self, region: &Region) -> Result<()> {
        let slab = self.slab(region)?;
        let tag = slab.unbind(&self.device, region)?;
        self.emit(DiagnosticOp::Unbind, tag, region);
        Ok(())
    }

    /// Does the region hold at least one bind?
    pub fn is_bound(&self, region: &Region) -> bool {
        self.slabs
            .get(region.slab())
            .is_some_and(|slab| slab.is_bound(region))
    }

    /// Number of slabs (live top-level device allocations) across all memory
    /// classes.
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// A snapshot of every slab's occupancy, in creation order.
    pub fn stats(&self) -> Vec<SlabStats> {
        self.slabs.all().iter().map(|slab| slab.stats()).collect()
    }

    fn pool(&self, memory_class: MemoryClass) -> Arc<Pool<D::Memory>> {
        if let Some(pool) = self.pools.read().get(&memory_class) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(memory_class)
            .or_insert_with(|| Arc::new(Pool::new(memory_class)))
            .clone()
    }

    fn slab(&self, region: &Region) -> Result<Arc<Slab<D::Memory>>> {
        self.slabs
            .get(region.slab())
            .ok_or_else(|| Error::invalid_region(*region, InvalidRegionReason::UnknownSlab))
    }

    fn emit(&self, op: DiagnosticOp, tag: Arc<str>, region: &Region) {
        if self.config.diagnostics {
            self.sink.record(DiagnosticEvent::new(op, tag, region));
        }
    }
}

impl<D> Drop for SlabAllocator<D>
where
    D: Device,
{
    fn drop(&mut self) {
        self.pools.write().clear();

        for slab in self.slabs.take_all() {
            for (region, tag) in slab.live_regions() {
                log::warn!("leaked {region} ('{tag}') at teardown");
            }
            match Arc::try_unwrap(slab) {
                // Safety: we are being dropped, so no region of ours can be
                // used anymore.
                Ok(slab) => unsafe { slab.destroy(&self.device) },
                Err(slab) => {
                    log::error!("{} still shared at teardown; not freeing it", slab.id())
                }
            }
        }
    }
}
