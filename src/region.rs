//! Regions: the caller-visible spans handed out by slabs, and the mapped view
//! of them returned by binding.

use crate::{Error, InvalidRegionReason, Result};
use core::{fmt, mem, ptr::NonNull};

/// Identifies one slab within a [`SlabAllocator`](crate::SlabAllocator).
///
/// Slab ids are dense and never reused: slabs live until the allocator is
/// dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabId(pub(crate) usize);

impl SlabId {
    /// The index of this slab in creation order.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slab#{}", self.0)
    }
}

/// A contiguous span `[start, start + width)` inside one slab.
///
/// Regions are plain values. A region is valid from the moment it is returned
/// by an allocation until it is passed to
/// [`SlabAllocator::free`](crate::SlabAllocator::free); after that, the same
/// value must not be used again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    slab: SlabId,
    start: u64,
    width: u64,
}

impl Region {
    #[inline]
    pub(crate) fn new(slab: SlabId, start: u64, width: u64) -> Self {
        debug_assert!(start.checked_add(width).is_some());
        Region { slab, start, width }
    }

    /// The slab this region lives in.
    #[inline]
    pub fn slab(&self) -> SlabId {
        self.slab
    }

    /// Byte offset of this region within its slab.
    ///
    /// This is the offset to bind a resource at.
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Size of this region, in bytes.
    #[inline]
    pub fn width(&self) -> u64 {
        self.width
    }

    /// One past the last byte of this region.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.width
    }

    /// Do these two regions share any byte?
    pub fn overlaps(&self, other: &Region) -> bool {
        self.slab == other.slab && self.start < other.end() && other.start < self.end()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:#x}..{:#x})", self.slab, self.start, self.end())
    }
}

/// A bound region: the capability to access a region's bytes through the
/// slab's host mapping.
///
/// Returned by [`SlabAllocator::bind`](crate::SlabAllocator::bind). The
/// pointer stays valid until the matching
/// [`unbind`](crate::SlabAllocator::unbind) (or the region's `free`) releases
/// the last reference to the slab's mapping.
#[derive(Debug)]
pub struct MappedRegion {
    region: Region,
    ptr: NonNull<u8>,
}

impl MappedRegion {
    /// Safety: `ptr` must point at `region.width()` bytes of mapped memory.
    pub(crate) unsafe fn new(region: Region, ptr: NonNull<u8>) -> Self {
        MappedRegion { region, ptr }
    }

    /// The region this mapping is for.
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Pointer to the first byte of the region.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapped region, in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        // The whole slab was mapped, so its regions fit in the address space.
        self.region.width() as usize
    }

    /// Is this mapping zero bytes long?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View the region as a slice of `T`.
    ///
    /// Fails with [`InvalidRegionReason::IncompatibleView`] unless the region's
    /// width is a whole number of `T`s and the mapping is suitably aligned for
    /// `T`. Zero-sized types are never compatible.
    pub fn typed<T>(&self) -> Result<NonNull<[T]>> {
        let elem_size = mem::size_of::<T>();
        let elem_align = mem::align_of::<T>();
        let incompatible = || {
            Error::invalid_region(
                self.region,
                InvalidRegionReason::IncompatibleView {
                    elem_size,
                    elem_align,
                },
            )
        };

        if elem_size == 0
            || self.len() % elem_size != 0
            || self.ptr.as_ptr() as usize % elem_align != 0
        {
            return Err(incompatible());
        }

        Ok(NonNull::slice_from_raw_parts(
            self.ptr.cast::<T>(),
            self.len() / elem_size,
        ))
    }

    /// Copy `bytes` into the region, starting `offset` bytes in.
    ///
    /// # Panics
    ///
    /// Panics if the write would run past the end of the region.
    ///
    /// # Safety
    ///
    /// The mapping must still be live, and nothing else (host or device) may
    /// access the written range concurrently.
    pub unsafe fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset
                .checked_add(bytes.len())
                .is_some_and(|end| end <= self.len()),
            "write of {} bytes at offset {offset} overruns {}",
            bytes.len(),
            self.region,
        );
        core::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            self.ptr.as_ptr().add(offset),
            bytes.len(),
        );
    }

    /// Copy bytes out of the region, starting `offset` bytes in, until `out`
    /// is full.
    ///
    /// # Panics
    ///
    /// Panics if the read would run past the end of the region.
    ///
    /// # Safety
    ///
    /// The mapping must still be live, and nothing may write to the read range
    /// concurrently.
    pub unsafe fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(
            offset
                .checked_add(out.len())
                .is_some_and(|end| end <= self.len()),
            "read of {} bytes at offset {offset} overruns {}",
            out.len(),
            self.region,
        );
        core::ptr::copy_nonoverlapping(
            self.ptr.as_ptr().add(offset),
            out.as_mut_ptr(),
            out.len(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(buf: &mut [u64], width: u64) -> MappedRegion {
        let region = Region::new(SlabId(0), 0, width);
        unsafe { MappedRegion::new(region, NonNull::new(buf.as_mut_ptr().cast()).unwrap()) }
    }

    #[test]
    fn overlap_requires_same_slab() {
        let a = Region::new(SlabId(0), 0, 16);
        let b = Region::new(SlabId(0), 8, 16);
        let c = Region::new(SlabId(1), 8, 16);
        let d = Region::new(SlabId(0), 16, 16);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn typed_view_checks_width() {
        let mut buf = [0u64; 4];
        let m = mapped(&mut buf, 32);
        assert_eq!(m.typed::<u32>().unwrap().len(), 8);
        assert_eq!(m.typed::<[u8; 16]>().unwrap().len(), 2);

        let m = mapped(&mut buf, 30);
        match m.typed::<u32>() {
            Err(Error::InvalidRegion {
                reason: InvalidRegionReason::IncompatibleView { elem_size: 4, .. },
                ..
            }) => {}
            other => panic!("expected an incompatible view, got {other:?}"),
        }
        assert!(m.typed::<u16>().is_ok());
        assert!(m.typed::<()>().is_err());
    }

    #[test]
    fn bytes_round_trip_through_mapping() {
        let mut buf = [0u64; 2];
        let m = mapped(&mut buf, 16);
        unsafe {
            m.write_bytes(4, &[1, 2, 3]);
            let mut out = [0; 5];
            m.read_bytes(3, &mut out);
            assert_eq!(out, [0, 1, 2, 3, 0]);
        }
    }

    #[test]
    #[should_panic(expected = "overruns")]
    fn write_past_end_panics() {
        let mut buf = [0u64; 1];
        let m = mapped(&mut buf, 8);
        unsafe { m.write_bytes(6, &[0; 4]) };
    }
}
