//! A slab: one large top-level device allocation, carved into regions.
//!
//! Free space inside a slab is tracked two ways:
//!
//! 1. Everything past the *tail* (the end of the highest occupied region) is
//!    free and untracked. Allocating there just bumps the tail.
//!
//! 2. Free spans below the tail are *gaps*, kept in insertion order. Gaps never
//!    overlap each other or any occupied region, and adjacent gaps are always
//!    coalesced, so no two gaps ever touch.
//!
//! When allocating we search the gaps first, newest to oldest, taking the first
//! gap that fits the request after alignment padding (first-fit, not best-fit:
//! a just-freed span is the first candidate for the next request of the same
//! shape). Only when no gap fits do we allocate at the tail.
//!
//! Freeing the tail-most region does not record a gap. Instead, every gap that
//! now lies at or beyond the new tail is dropped, since that space is covered
//! by the untracked tail again. This keeps the invariant that all gaps lie
//! below the tail, which is what makes gap and tail allocation disjoint.
//!
//! The mapping state lives behind its own lock so that binding a region never
//! waits on allocation bookkeeping for unrelated regions, and vice versa. The
//! one place both are held is `free`: it releases the region's binds while the
//! layout is still write-locked, so the span cannot be handed to a new owner
//! (and bound by it) before the old owner's binds are gone. Lock order is
//! layout, then mapping.

use crate::{
    align_up, Device, Error, InvalidRegionReason, MappedRegion, MemoryClass, Region, Result,
    SlabId,
};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    ptr::NonNull,
    sync::Arc,
};

pub(crate) mod sync;
use sync::{Mutex, RwLock};

/// A snapshot of one slab's occupancy, for leak and fragmentation triage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlabStats {
    /// The slab.
    pub id: SlabId,
    /// The slab's memory class.
    pub memory_class: MemoryClass,
    /// Size of the slab, in bytes.
    pub capacity: u64,
    /// Bytes in live regions.
    pub used: u64,
    /// Bytes in gaps below the tail.
    pub gap_bytes: u64,
    /// Number of gaps below the tail.
    pub gap_count: usize,
    /// Width of the largest gap, or zero.
    pub largest_gap: u64,
    /// Untracked bytes past the tail.
    pub tail_free: u64,
    /// Number of live regions.
    pub live_regions: usize,
    /// Outstanding binds across all of the slab's regions.
    pub map_refcount: usize,
}

pub(crate) struct Slab<M> {
    id: SlabId,
    memory_class: MemoryClass,
    capacity: u64,
    memory: M,
    layout: RwLock<Layout>,
    mapping: Mutex<Mapping>,
}

impl<M> Slab<M> {
    pub(crate) fn new(id: SlabId, memory_class: MemoryClass, capacity: u64, memory: M) -> Self {
        Slab {
            id,
            memory_class,
            capacity,
            memory,
            layout: RwLock::new(Layout::default()),
            mapping: Mutex::new(Mapping::default()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> SlabId {
        self.id
    }

    #[inline]
    pub(crate) fn memory_class(&self) -> MemoryClass {
        self.memory_class
    }

    #[inline]
    pub(crate) fn memory(&self) -> &M {
        &self.memory
    }

    /// Try to carve a region of `size` bytes aligned to `alignment` out of this
    /// slab. Returns `None` if this slab cannot fit it.
    pub(crate) fn try_allocate(
        &self,
        size: u64,
        alignment: u64,
        tag: &Arc<str>,
    ) -> Option<Region> {
        debug_assert_ne!(size, 0);
        debug_assert_ne!(alignment, 0);

        let mut layout = self.layout.write();
        let start = layout.allocate(self.capacity, size, alignment, tag)?;
        debug_assert_eq!(start % alignment, 0);
        debug_assert!(start + size <= self.capacity);
        Some(Region::new(self.id, start, size))
    }

    /// Return a region to this slab, releasing any binds it still holds.
    ///
    /// The layout stays write-locked until the binds are gone, so no other
    /// region can be carved out of the same span (and bound) in between. The
    /// region is freed even when unmapping the slab fails; that failure is
    /// reported in [`Freed::unmapped`].
    pub(crate) fn free<D>(&self, device: &D, region: &Region) -> Result<Freed>
    where
        D: Device<Memory = M>,
    {
        debug_assert_eq!(region.slab(), self.id);
        let mut layout = self.layout.write();
        let tag = layout
            .free(region.start(), region.width())
            .ok_or_else(|| Error::invalid_region(*region, InvalidRegionReason::NotAllocated))?;
        let (released_binds, unmapped) = self.release_binds(device, region);
        drop(layout);

        Ok(Freed {
            tag,
            released_binds,
            unmapped,
        })
    }

    /// The tag of a live region, or `None` if the region is not live here.
    pub(crate) fn live_tag(&self, region: &Region) -> Option<Arc<str>> {
        self.layout
            .read()
            .occupied
            .get(&region.start())
            .filter(|live| live.width == region.width())
            .map(|live| live.tag.clone())
    }

    /// Every live region and its tag.
    pub(crate) fn live_regions(&self) -> Vec<(Region, Arc<str>)> {
        self.layout
            .read()
            .occupied
            .iter()
            .map(|(start, live)| (Region::new(self.id, *start, live.width), live.tag.clone()))
            .collect()
    }

    pub(crate) fn stats(&self) -> SlabStats {
        let map_refcount = self.mapping.lock().refcount;

        let layout = self.layout.read();
        let tail = layout.tail();
        SlabStats {
            id: self.id,
            memory_class: self.memory_class,
            capacity: self.capacity,
            used: layout.used,
            gap_bytes: layout.gaps.iter().map(|g| g.width).sum(),
            gap_count: layout.gaps.len(),
            largest_gap: layout.gaps.iter().map(|g| g.width).max().unwrap_or(0),
            tail_free: self.capacity - tail,
            live_regions: layout.occupied.len(),
            map_refcount,
        }
    }

    /// Is the slab's memory currently mapped?
    #[cfg(test)]
    pub(crate) fn is_mapped(&self) -> bool {
        self.mapping.lock().base.is_some()
    }

    /// Does the region hold at least one bind?
    pub(crate) fn is_bound(&self, region: &Region) -> bool {
        self.mapping
            .lock()
            .binds
            .get(&region.start())
            .is_some_and(|bound| bound.width == region.width())
    }

    /// Take a reference on the slab's mapping, mapping the whole slab if this
    /// is the first one, and return a view of `region` within it.
    ///
    /// The caller must have checked that `region` is live in this slab.
    pub(crate) fn bind<D>(
        &self,
        device: &D,
        region: &Region,
        tag: Arc<str>,
    ) -> Result<MappedRegion>
    where
        D: Device<Memory = M>,
    {
        let mut mapping = self.mapping.lock();
        let base = match mapping.base {
            Some(MappedBase(base)) => base,
            None => {
                debug_assert_eq!(mapping.refcount, 0);
                log::debug!("mapping {} ({} bytes)", self.id, self.capacity);
                // Safety: the memory came from this device with `capacity`
                // bytes, and is not mapped.
                let base = unsafe { device.map_memory(&self.memory, self.capacity) }
                    .map_err(|source| self.mapping_failure(source))?;
                mapping.base = Some(MappedBase(base));
                base
            }
        };

        mapping.refcount += 1;
        mapping
            .binds
            .entry(region.start())
            .or_insert_with(|| Bound {
                width: region.width(),
                count: 0,
                tag,
            })
            .count += 1;

        // Safety: the region lies within the slab, which is mapped in full.
        unsafe {
            let ptr = NonNull::new_unchecked(base.as_ptr().add(region.start() as usize));
            Ok(MappedRegion::new(*region, ptr))
        }
    }

    /// Release one reference on the slab's mapping taken by binding `region`,
    /// unmapping the slab when it was the last one. Returns the region's tag.
    pub(crate) fn unbind<D>(&self, device: &D, region: &Region) -> Result<Arc<str>>
    where
        D: Device<Memory = M>,
    {
        let mut mapping = self.mapping.lock();
        let tag = match mapping.binds.entry(region.start()) {
            Entry::Occupied(mut entry) if entry.get().width == region.width() => {
                let bound = entry.get_mut();
                bound.count -= 1;
                let tag = bound.tag.clone();
                if bound.count == 0 {
                    entry.remove();
                }
                tag
            }
            _ => {
                return Err(Error::invalid_region(
                    *region,
                    InvalidRegionReason::NotBound,
                ))
            }
        };
        mapping.refcount -= 1;
        self.unmap_if_unused(device, &mut mapping)?;
        Ok(tag)
    }

    /// Drop every bind still held by `region`, returning how many there were
    /// and the outcome of unmapping the slab if that was the last reference.
    fn release_binds<D>(&self, device: &D, region: &Region) -> (usize, Result<()>)
    where
        D: Device<Memory = M>,
    {
        let mut mapping = self.mapping.lock();
        let Some(bound) = mapping.binds.remove(&region.start()) else {
            return (0, Ok(()));
        };
        debug_assert_eq!(bound.width, region.width());
        mapping.refcount -= bound.count;
        (bound.count, self.unmap_if_unused(device, &mut mapping))
    }

    fn unmap_if_unused<D>(&self, device: &D, mapping: &mut Mapping) -> Result<()>
    where
        D: Device<Memory = M>,
    {
        debug_assert_eq!(
            mapping.refcount,
            mapping.binds.values().map(|b| b.count).sum::<usize>()
        );
        if mapping.refcount > 0 {
            return Ok(());
        }
        if mapping.base.take().is_some() {
            log::debug!("unmapping {}", self.id);
            // Safety: the slab was mapped and the last pointer derived from
            // the mapping was just released.
            unsafe { device.unmap_memory(&self.memory) }
                .map_err(|source| self.mapping_failure(source))?;
        }
        Ok(())
    }

    fn mapping_failure(&self, source: crate::DeviceError) -> Error {
        Error::MappingFailure {
            slab: self.id,
            memory_class: self.memory_class,
            source,
        }
    }

    /// Tear the slab down, returning its memory to the device.
    ///
    /// Safety: nothing may use the slab's memory or any pointer into its
    /// mapping afterwards.
    pub(crate) unsafe fn destroy<D>(self, device: &D)
    where
        D: Device<Memory = M>,
    {
        let mapping = self.mapping.into_inner();
        if mapping.base.is_some() {
            log::warn!(
                "{} still mapped at teardown with {} outstanding binds",
                self.id,
                mapping.refcount
            );
            if let Err(e) = device.unmap_memory(&self.memory) {
                log::warn!("failed to unmap {} at teardown: {e}", self.id);
            }
        }
        log::debug!("returning {} ({} bytes) to the device", self.id, self.capacity);
        device.free_memory(self.memory);
    }
}

/// What freeing a region did.
pub(crate) struct Freed {
    /// The tag the region was allocated with.
    pub(crate) tag: Arc<str>,
    /// Binds the region still held, now released.
    pub(crate) released_binds: usize,
    /// Whether unmapping the slab succeeded, when releasing those binds
    /// dropped the last reference to its mapping.
    pub(crate) unmapped: Result<()>,
}

/// Wrapper for the mapped base pointer.
#[derive(Clone, Copy)]
struct MappedBase(NonNull<u8>);

// Safety: the pointer is only an address into device memory mapped for the
// whole process. Access to the pointee is governed by the region capabilities
// handed out by `bind`, not by which thread holds this value.
unsafe impl Send for MappedBase {}
unsafe impl Sync for MappedBase {}

#[derive(Default)]
struct Mapping {
    /// The host address of the whole slab, present iff `refcount > 0`.
    base: Option<MappedBase>,
    /// Outstanding binds across all regions.
    refcount: usize,
    /// Outstanding binds per region, keyed by region start.
    binds: BTreeMap<u64, Bound>,
}

struct Bound {
    width: u64,
    count: usize,
    tag: Arc<str>,
}

/// A live region's bookkeeping.
#[derive(Debug)]
struct Live {
    width: u64,
    tag: Arc<str>,
}

/// A free span below the tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Gap {
    start: u64,
    width: u64,
}

impl Gap {
    #[inline]
    fn end(&self) -> u64 {
        self.start + self.width
    }
}

/// The structural state of a slab: what is occupied and what is free.
#[derive(Debug, Default)]
struct Layout {
    /// Live regions, keyed by start offset.
    occupied: BTreeMap<u64, Live>,
    /// Free spans below the tail, oldest first.
    gaps: Vec<Gap>,
    /// Sum of the widths of all live regions.
    used: u64,
}

impl Layout {
    /// The end of the highest occupied region, or zero if nothing is occupied.
    fn tail(&self) -> u64 {
        // Occupied regions never overlap, so the one that starts last also
        // ends last.
        self.occupied
            .last_key_value()
            .map_or(0, |(start, live)| start + live.width)
    }

    fn allocate(
        &mut self,
        capacity: u64,
        size: u64,
        alignment: u64,
        tag: &Arc<str>,
    ) -> Option<u64> {
        // Not enough free bytes in total, however they are arranged. We don't
        // try to defragment.
        if size > capacity - self.used {
            return None;
        }

        let start = match self.take_from_gaps(size, alignment) {
            Some(start) => start,
            None => self.take_from_tail(capacity, size, alignment)?,
        };

        let old = self.occupied.insert(
            start,
            Live {
                width: size,
                tag: tag.clone(),
            },
        );
        debug_assert!(old.is_none());
        self.used += size;
        Some(start)
    }

    fn take_from_gaps(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let (index, start) = self.gaps.iter().enumerate().rev().find_map(|(i, gap)| {
            let start = align_up(gap.start, alignment)?;
            let needed = (start - gap.start).checked_add(size)?;
            (needed <= gap.width).then_some((i, start))
        })?;

        let gap = self.gaps.remove(index);
        let padding = start - gap.start;
        if padding > 0 {
            self.insert_gap(Gap {
                start: gap.start,
                width: padding,
            });
        }
        let residual = gap.width - padding - size;
        if residual > 0 {
            self.insert_gap(Gap {
                start: start + size,
                width: residual,
            });
        }
        Some(start)
    }

    fn take_from_tail(&mut self, capacity: u64, size: u64, alignment: u64) -> Option<u64> {
        let tail = self.tail();
        let start = align_up(tail, alignment)?;
        if start.checked_add(size)? > capacity {
            return None;
        }
        // Keep the alignment padding reclaimable.
        if start > tail {
            self.insert_gap(Gap {
                start: tail,
                width: start - tail,
            });
        }
        Some(start)
    }

    /// Record a free span, merging it with any gap it touches.
    fn insert_gap(&mut self, mut gap: Gap) {
        debug_assert_ne!(gap.width, 0);
        loop {
            if let Some(i) = self.gaps.iter().position(|g| g.end() == gap.start) {
                let before = self.gaps.remove(i);
                gap = Gap {
                    start: before.start,
                    width: before.width + gap.width,
                };
            } else if let Some(i) = self.gaps.iter().position(|g| g.start == gap.end()) {
                let after = self.gaps.remove(i);
                gap.width += after.width;
            } else {
                break;
            }
        }
        self.gaps.push(gap);
    }

    /// Free the live region at `start` with the given width. Returns its tag,
    /// or `None` if no such region is live.
    fn free(&mut self, start: u64, width: u64) -> Option<Arc<str>> {
        let live = match self.occupied.entry(start) {
            Entry::Occupied(entry) if entry.get().width == width => entry.remove(),
            _ => return None,
        };
        self.used -= width;

        let tail = self.tail();
        if start + width > tail {
            // This was the tail-most region: everything from the new tail on
            // is untracked free space again, including any gaps in it.
            self.gaps.retain(|g| g.start < tail);
        } else {
            self.insert_gap(Gap { start, width });
        }
        Some(live.tag)
    }

    /// Check every structural invariant.
    #[cfg(test)]
    fn check(&self, capacity: u64) -> core::result::Result<(), String> {
        let tail = self.tail();
        if tail > capacity {
            return Err(format!("tail {tail} is past capacity {capacity}"));
        }

        let mut spans: Vec<(u64, u64, bool)> = self
            .occupied
            .iter()
            .map(|(s, l)| (*s, s + l.width, true))
            .chain(self.gaps.iter().map(|g| (g.start, g.end(), false)))
            .collect();
        spans.sort();
        for w in spans.windows(2) {
            if w[0].1 > w[1].0 {
                return Err(format!("{:?} overlaps {:?}", w[0], w[1]));
            }
            if !w[0].2 && !w[1].2 && w[0].1 == w[1].0 {
                return Err(format!("adjacent gaps {:?} and {:?}", w[0], w[1]));
            }
        }
        if let Some(g) = self.gaps.iter().find(|g| g.end() > tail) {
            return Err(format!("gap {g:?} beyond tail {tail}"));
        }

        let used: u64 = self.occupied.values().map(|l| l.width).sum();
        if used != self.used {
            return Err(format!("used is {} but regions sum to {used}", self.used));
        }
        let gaps: u64 = self.gaps.iter().map(|g| g.width).sum();
        if used + gaps > capacity {
            return Err(format!("{used} used + {gaps} in gaps exceeds {capacity}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn tag() -> Arc<str> {
        Arc::from("test")
    }

    fn alloc(layout: &mut Layout, capacity: u64, size: u64, alignment: u64) -> Option<u64> {
        let start = layout.allocate(capacity, size, alignment, &tag());
        layout.check(capacity).unwrap();
        start
    }

    fn free(layout: &mut Layout, capacity: u64, start: u64, width: u64) {
        assert!(layout.free(start, width).is_some());
        layout.check(capacity).unwrap();
    }

    #[test]
    fn gap_before_tail() {
        let mut layout = Layout::default();
        let a = alloc(&mut layout, 1024, 300, 256).unwrap();
        assert_eq!(a, 0);
        let b = alloc(&mut layout, 1024, 300, 256).unwrap();
        assert_eq!(b, 512);
        assert_eq!(layout.tail(), 812);

        free(&mut layout, 1024, a, 300);
        assert_eq!(layout.gaps, [Gap { start: 0, width: 512 }]);

        let c = alloc(&mut layout, 1024, 200, 1).unwrap();
        assert!(c + 200 <= 512, "landed at {c}, not inside [0, 512)");
        assert_eq!(c, 0);
    }

    #[test]
    fn aligned_starts() {
        let mut layout = Layout::default();
        for (size, align) in [(3, 1), (5, 8), (17, 64), (1, 3), (100, 256), (9, 24)] {
            let start = alloc(&mut layout, 4096, size, align).unwrap();
            assert_eq!(start % align, 0, "size {size} align {align} at {start}");
        }
    }

    #[test]
    fn freed_span_is_reused() {
        let mut layout = Layout::default();
        let _a = alloc(&mut layout, 4096, 64, 16).unwrap();
        let b = alloc(&mut layout, 4096, 128, 16).unwrap();
        let _c = alloc(&mut layout, 4096, 64, 16).unwrap();

        free(&mut layout, 4096, b, 128);
        assert_eq!(alloc(&mut layout, 4096, 128, 16), Some(b));
    }

    #[test]
    fn freed_tail_is_reused() {
        let mut layout = Layout::default();
        let _a = alloc(&mut layout, 4096, 64, 16).unwrap();
        let b = alloc(&mut layout, 4096, 128, 16).unwrap();

        free(&mut layout, 4096, b, 128);
        assert!(layout.gaps.is_empty());
        assert_eq!(alloc(&mut layout, 4096, 128, 16), Some(b));
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let mut layout = Layout::default();
        let a = alloc(&mut layout, 1024, 100, 1).unwrap();
        let b = alloc(&mut layout, 1024, 150, 1).unwrap();
        let _c = alloc(&mut layout, 1024, 10, 1).unwrap();

        free(&mut layout, 1024, b, 150);
        free(&mut layout, 1024, a, 100);
        assert_eq!(layout.gaps, [Gap { start: 0, width: 250 }]);

        // Bigger than either freed region, but fits their union.
        assert_eq!(alloc(&mut layout, 1024, 240, 1), Some(0));
    }

    #[test]
    fn gap_between_two_gaps_merges_all_three() {
        let mut layout = Layout::default();
        let starts: Vec<u64> = (0..4)
            .map(|_| alloc(&mut layout, 1024, 10, 1).unwrap())
            .collect();
        free(&mut layout, 1024, starts[0], 10);
        free(&mut layout, 1024, starts[2], 10);
        assert_eq!(layout.gaps.len(), 2);
        free(&mut layout, 1024, starts[1], 10);
        assert_eq!(layout.gaps, [Gap { start: 0, width: 30 }]);
    }

    #[test]
    fn out_of_order_tail_frees_lose_no_space() {
        let mut layout = Layout::default();
        let a = alloc(&mut layout, 1024, 100, 1).unwrap();
        let b = alloc(&mut layout, 1024, 100, 1).unwrap();
        let c = alloc(&mut layout, 1024, 100, 1).unwrap();

        // `b` is not tail-most when freed, so it becomes a gap...
        free(&mut layout, 1024, b, 100);
        // ...which is swallowed by the tail once `c` goes.
        free(&mut layout, 1024, c, 100);
        assert!(layout.gaps.is_empty());
        assert_eq!(layout.tail(), a + 100);

        free(&mut layout, 1024, a, 100);
        assert_eq!(layout.tail(), 0);
        assert_eq!(alloc(&mut layout, 1024, 1024, 1), Some(0));
    }

    #[test]
    fn padding_is_split_off_gaps() {
        let mut layout = Layout::default();
        let _x = alloc(&mut layout, 1024, 10, 1).unwrap();
        let a = alloc(&mut layout, 1024, 100, 1).unwrap();
        let _b = alloc(&mut layout, 1024, 100, 1).unwrap();
        free(&mut layout, 1024, a, 100);
        assert_eq!(layout.gaps, [Gap { start: 10, width: 100 }]);

        assert_eq!(alloc(&mut layout, 1024, 20, 32), Some(32));
        assert_eq!(
            layout.gaps,
            [Gap { start: 10, width: 22 }, Gap { start: 52, width: 58 }]
        );
    }

    #[test]
    fn fast_reject_counts_only_live_bytes() {
        let mut layout = Layout::default();
        let a = alloc(&mut layout, 100, 60, 1).unwrap();
        assert_eq!(alloc(&mut layout, 100, 41, 1), None);
        assert_eq!(alloc(&mut layout, 100, 40, 1), Some(60));
        free(&mut layout, 100, a, 60);
        assert_eq!(alloc(&mut layout, 100, 60, 1), Some(0));
    }

    #[test]
    fn enough_bytes_but_not_contiguous() {
        let mut layout = Layout::default();
        let starts: Vec<u64> = (0..4)
            .map(|_| alloc(&mut layout, 100, 25, 1).unwrap())
            .collect();
        free(&mut layout, 100, starts[0], 25);
        free(&mut layout, 100, starts[2], 25);
        assert_eq!(alloc(&mut layout, 100, 50, 1), None);
    }

    #[test]
    fn double_free_and_wrong_width_are_rejected() {
        let mut layout = Layout::default();
        let a = alloc(&mut layout, 100, 10, 1).unwrap();
        let _b = alloc(&mut layout, 100, 10, 1).unwrap();
        assert!(layout.free(a, 11).is_none());
        assert!(layout.free(a + 1, 10).is_none());
        assert!(layout.free(a, 10).is_some());
        assert!(layout.free(a, 10).is_none());
        layout.check(100).unwrap();
    }

    #[test]
    fn random_operations_keep_partition() {
        let _ = env_logger::try_init();

        const CAPACITY: u64 = 1 << 16;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut layout = Layout::default();
        let mut live: Vec<(u64, u64)> = vec![];

        for _ in 0..20_000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..=2048);
                let align = 1 << rng.gen_range(0..10);
                if let Some(start) = layout.allocate(CAPACITY, size, align, &tag()) {
                    assert_eq!(start % align, 0);
                    assert!(live.iter().all(|&(s, w)| start + size <= s || s + w <= start));
                    live.push((start, size));
                }
            } else {
                let (start, width) = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(layout.free(start, width).is_some());
            }
            if let Err(e) = layout.check(CAPACITY) {
                panic!("invariant violated: {e}\n{layout:#?}");
            }
        }
    }

    #[cfg(feature = "host")]
    mod mapping {
        use super::*;
        use crate::{Device, HostDevice, HostMemory, MemoryClass};

        fn slab(device: &HostDevice, id: usize, capacity: u64) -> Slab<HostMemory> {
            let memory = device.allocate_memory(MemoryClass(1), capacity).unwrap();
            Slab::new(SlabId(id), MemoryClass(1), capacity, memory)
        }

        #[test]
        fn binds_share_one_mapping_per_slab() {
            let device = HostDevice::default();
            let first = slab(&device, 0, 1024);
            let second = slab(&device, 1, 1024);

            let a = first.try_allocate(64, 16, &tag()).unwrap();
            let b = first.try_allocate(64, 16, &tag()).unwrap();
            let c = second.try_allocate(64, 16, &tag()).unwrap();

            let ma = first.bind(&device, &a, tag()).unwrap();
            let mb = first.bind(&device, &b, tag()).unwrap();
            assert_eq!(device.map_calls(), 1);
            assert_eq!(first.stats().map_refcount, 2);
            assert_eq!(
                mb.as_ptr().as_ptr() as usize - ma.as_ptr().as_ptr() as usize,
                (b.start() - a.start()) as usize
            );

            second.bind(&device, &c, tag()).unwrap();
            assert_eq!(first.stats().map_refcount, 2);
            second.unbind(&device, &c).unwrap();
            assert_eq!(first.stats().map_refcount, 2);

            first.unbind(&device, &a).unwrap();
            assert!(first.is_mapped());
            first.unbind(&device, &b).unwrap();
            assert!(!first.is_mapped());
            assert_eq!(first.stats().map_refcount, 0);
            assert_eq!(device.map_calls(), 2);
            assert_eq!(device.unmap_calls(), 2);

            unsafe {
                first.destroy(&device);
                second.destroy(&device);
            }
            assert_eq!(device.live_allocations(), 0);
        }

        #[test]
        fn unbind_without_bind_is_rejected() {
            let device = HostDevice::default();
            let slab = slab(&device, 0, 1024);
            let a = slab.try_allocate(64, 16, &tag()).unwrap();
            assert!(matches!(
                slab.unbind(&device, &a),
                Err(Error::InvalidRegion {
                    reason: InvalidRegionReason::NotBound,
                    ..
                })
            ));
            slab.bind(&device, &a, tag()).unwrap();
            slab.unbind(&device, &a).unwrap();
            assert!(slab.unbind(&device, &a).is_err());
            unsafe { slab.destroy(&device) };
        }

        #[test]
        fn freeing_releases_binds_and_unmaps() {
            let device = HostDevice::default();
            let slab = slab(&device, 0, 1024);
            let a = slab.try_allocate(64, 16, &tag()).unwrap();
            slab.bind(&device, &a, tag()).unwrap();
            slab.bind(&device, &a, tag()).unwrap();
            assert!(slab.is_bound(&a));

            let freed = slab.free(&device, &a).unwrap();
            assert_eq!(freed.released_binds, 2);
            assert!(freed.unmapped.is_ok());
            assert!(!slab.is_bound(&a));
            assert!(!slab.is_mapped());
            assert!(slab.free(&device, &a).is_err());
            unsafe { slab.destroy(&device) };
        }

        #[test]
        fn next_owner_of_a_span_starts_unbound() {
            let device = HostDevice::default();
            let slab = slab(&device, 0, 1024);
            let a = slab.try_allocate(1024, 1, &tag()).unwrap();
            slab.bind(&device, &a, tag()).unwrap();
            assert_eq!(slab.free(&device, &a).unwrap().released_binds, 1);

            // Same span, new owner: only its own bind is counted.
            let b = slab.try_allocate(1024, 1, &tag()).unwrap();
            assert_eq!(b, a);
            assert!(!slab.is_bound(&b));
            slab.bind(&device, &b, tag()).unwrap();
            assert_eq!(slab.stats().map_refcount, 1);
            slab.unbind(&device, &b).unwrap();
            assert!(!slab.is_mapped());
            assert_eq!(device.map_calls(), device.unmap_calls());
            unsafe { slab.destroy(&device) };
        }

        #[test]
        fn unmap_failure_still_frees() {
            let device = HostDevice::default();
            let slab = slab(&device, 5, 1024);
            let a = slab.try_allocate(64, 16, &tag()).unwrap();
            slab.bind(&device, &a, tag()).unwrap();

            device.fail_next_unmap();
            let freed = slab.free(&device, &a).unwrap();
            assert_eq!(freed.released_binds, 1);
            match freed.unmapped {
                Err(Error::MappingFailure { slab: id, .. }) => assert_eq!(id, SlabId(5)),
                other => panic!("expected a mapping failure, got {other:?}"),
            }
            assert_eq!(slab.stats().live_regions, 0);
            assert_eq!(slab.stats().map_refcount, 0);
            assert!(!slab.is_mapped());
            unsafe { slab.destroy(&device) };
            assert_eq!(device.live_allocations(), 0);
        }

        #[test]
        fn map_failure_leaves_slab_unmapped() {
            let device = HostDevice::default();
            let slab = slab(&device, 3, 1024);
            let a = slab.try_allocate(64, 16, &tag()).unwrap();
            device.fail_next_map();
            match slab.bind(&device, &a, tag()) {
                Err(Error::MappingFailure { slab: id, .. }) => assert_eq!(id, SlabId(3)),
                other => panic!("expected a mapping failure, got {other:?}"),
            }
            assert!(!slab.is_mapped());
            assert_eq!(slab.stats().map_refcount, 0);
            assert!(slab.bind(&device, &a, tag()).is_ok());
            unsafe { slab.destroy(&device) };
        }
    }
}
