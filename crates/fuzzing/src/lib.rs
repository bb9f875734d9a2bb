//! Shared fuzzing and testing infrastructure for `slab_suballoc`.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use slab_suballoc::{
    AllocatorConfig, DeviceLimits, Error, HostDevice, InvalidRegionReason, MappedRegion,
    MemoryProperties, MemoryRequirements, Region, ResourceKind, SlabAllocator,
};
use std::collections::BTreeMap;

/// An allocation request made by a test operation.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct Request {
    size: u32,
    align: u32,
    host_visible: bool,
    image: bool,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            size: 1,
            align: 1,
            host_visible: true,
            image: false,
        }
    }
}

impl Request {
    /// A buffer request for host-visible memory.
    pub fn host(size: u32, align: u32) -> Self {
        Request {
            size,
            align,
            host_visible: true,
            image: false,
        }
    }

    /// A request for device-local memory.
    pub fn device_local(size: u32, align: u32, image: bool) -> Self {
        Request {
            size,
            align,
            host_visible: false,
            image,
        }
    }

    fn requirements(&self) -> MemoryRequirements {
        MemoryRequirements {
            size: self.size.into(),
            alignment: self.align.into(),
            type_bits: 0b11,
        }
    }

    fn properties(&self) -> MemoryProperties {
        if self.host_visible {
            MemoryProperties::HOST_VISIBLE
        } else {
            MemoryProperties::DEVICE_LOCAL
        }
    }

    fn kind(&self) -> ResourceKind {
        if self.image {
            ResourceKind::Image
        } else {
            ResourceKind::Buffer
        }
    }
}

impl DefaultMutate for Request {
    type DefaultMutate = RequestMutator;
}

/// A mutator for `Request`s with configurable maximums for size and
/// alignment.
#[derive(Debug)]
pub struct RequestMutator {
    pub max_size: u32,
    pub max_align: u32,
}

impl Default for RequestMutator {
    fn default() -> Self {
        Self {
            max_size: 8192,
            max_align: 4096,
        }
    }
}

impl RequestMutator {
    fn gen_align(&self, ctx: &mut mutatis::Context, max_align: u32) -> mutatis::Result<u32> {
        // Mostly powers of two, like real devices ask for, but any alignment
        // (including the invalid zero) is fair game.
        if ctx.rng().gen_bool() {
            let log2 = m::range(0..=max_align.max(1).ilog2()).generate(ctx)?;
            Ok(1 << log2)
        } else {
            m::range(0..=max_align).generate(ctx)
        }
    }
}

impl Mutate<Request> for RequestMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        request: &mut Request,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                request.size
            } else {
                self.max_size
            };
            request.size = m::range(0..=max_size).generate(ctx)?;
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max_align = if ctx.shrink() {
                request.align
            } else {
                self.max_align
            };
            request.align = self.gen_align(ctx, max_align)?;
            Ok(())
        })?;

        // Mutate memory class and kind.
        if !c.shrink() {
            c.mutation(|ctx| {
                request.host_visible = ctx.rng().gen_bool();
                Ok(())
            })?;
            c.mutation(|ctx| {
                request.image = ctx.rng().gen_bool();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Request> for RequestMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Request> {
        let size = m::range(0..=self.max_size).generate(ctx)?;
        let align = self.gen_align(ctx, self.max_align)?;
        Ok(Request {
            size,
            align,
            host_visible: ctx.rng().gen_bool(),
            image: ctx.rng().gen_index(8) == Some(0),
        })
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, request: Request },
    Free { id: u32 },
    Bind { id: u32 },
    Unbind { id: u32 },
    Write { id: u32, byte: u8 },
    Check { id: u32 },
}

impl Op {
    fn id_mut(&mut self) -> &mut u32 {
        match self {
            Op::Alloc { id, .. }
            | Op::Free { id }
            | Op::Bind { id }
            | Op::Unbind { id }
            | Op::Write { id, .. }
            | Op::Check { id } => id,
        }
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    request: m::default::<Request>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Bind {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Unbind {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Write {
                    id: ctx.rng().gen_u32(),
                    byte: m::default::<u8>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Check {
                    id: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                *ops.ops[op_index].id_mut() = new_id;
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Bind an existing allocation, write through the mapping, read it
        // back, and unbind it again.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let byte = m::default::<u8>().generate(ctx)?;
                    let index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.splice(
                        index..index,
                        [
                            Op::Bind { id },
                            Op::Write { id, byte },
                            Op::Check { id },
                            Op::Unbind { id },
                        ],
                    );
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation. Returns `false` if there was none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh allocator over a small
    /// [`HostDevice`], keeping at most `allocation_limit` bytes live.
    pub fn run(&self, allocation_limit: u64) -> Result<(), String> {
        let device = HostDevice::new(
            DeviceLimits {
                max_allocation_count: 16,
                min_allocation_granularity: 256,
            },
            vec![
                MemoryProperties::DEVICE_LOCAL,
                MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            ],
        );
        let config = AllocatorConfig::from_env()
            .with_buffer_block_size(4096)
            .with_image_block_size(16384);
        self.run_with_allocator(&SlabAllocator::new(device, config), allocation_limit)
    }

    /// Run these test operations with the given allocator and allocation limit.
    ///
    /// The allocator must not have any live regions.
    pub fn run_with_allocator(
        &self,
        allocator: &SlabAllocator<HostDevice>,
        allocation_limit: u64,
    ) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // Free the allocation with the given id, poisoning it first if we can
        // still write to it.
        let free = |id: u32, alloc: LiveRegion| -> Result<(), String> {
            log::debug!("freeing id{id} -> {alloc:?}");
            if let Some(map) = alloc.maps.last() {
                unsafe { map.write_bytes(0, &vec![FREE_POISON_PATTERN; map.len()]) };
            }
            let bound = !alloc.maps.is_empty();
            allocator
                .free(alloc.region)
                .map_err(|e| format!("freeing a live region failed: {e}"))?;
            ensure!(
                !allocator.is_bound(&alloc.region),
                "region still bound after free (was bound: {bound})",
            );
            ensure!(
                matches!(
                    allocator.free(alloc.region),
                    Err(Error::InvalidRegion {
                        reason: InvalidRegionReason::NotAllocated,
                        ..
                    })
                ),
                "double free of {} was not rejected",
                alloc.region,
            );
            Ok(())
        };

        // Assert that a new region satisfies its request and does not overlap
        // any other live region.
        let assert_fits_request =
            |live: &LiveMap, region: Region, request: &Request| -> Result<(), String> {
                ensure!(
                    region.width() == u64::from(request.size),
                    "region {region} has the wrong width for {request:?}",
                );
                ensure!(
                    region.start() % u64::from(request.align) == 0,
                    "region {region} is not aligned for {request:?}",
                );
                for other in live.map.values() {
                    ensure!(
                        !region.overlaps(&other.region),
                        "two distinct live regions should never overlap: {region} and {}",
                        other.region,
                    );
                }
                Ok(())
            };

        // Assert that the allocator's own accounting agrees with ours.
        let assert_stats = |live: &LiveMap| -> Result<(), String> {
            let stats = allocator.stats();
            ensure!(
                stats.len() == allocator.slab_count(),
                "stats cover {} slabs but {} exist",
                stats.len(),
                allocator.slab_count(),
            );
            ensure!(
                allocator.device().live_allocations() == allocator.slab_count(),
                "device has {} live allocations but there are {} slabs",
                allocator.device().live_allocations(),
                allocator.slab_count(),
            );
            for s in &stats {
                ensure!(
                    s.used + s.gap_bytes + s.tail_free <= s.capacity,
                    "slab accounting exceeds capacity: {s:?}",
                );
                ensure!(s.largest_gap <= s.gap_bytes, "bad largest gap: {s:?}");
            }
            let used: u64 = stats.iter().map(|s| s.used).sum();
            ensure!(
                used == live.total_allocated_bytes,
                "slabs report {used} bytes used but {} are live",
                live.total_allocated_bytes,
            );
            let binds: usize = stats.iter().map(|s| s.map_refcount).sum();
            let expected: usize = live.map.values().map(|a| a.maps.len()).sum();
            ensure!(binds == expected, "slabs report {binds} binds, expected {expected}");
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, request } => {
                    if live.beyond_allocation_limit(request.size.into()) {
                        continue;
                    }

                    let tag = format!("id{id}");
                    let result = allocator.allocate(
                        &tag,
                        request.requirements(),
                        request.properties(),
                        request.kind(),
                    );

                    if request.size == 0 {
                        ensure!(
                            matches!(result, Err(Error::EmptyRequest { .. })),
                            "zero-sized request gave {result:?}",
                        );
                        continue;
                    }
                    if request.align == 0 {
                        ensure!(
                            matches!(result, Err(Error::InvalidAlignment { .. })),
                            "zero alignment gave {result:?}",
                        );
                        continue;
                    }

                    match result {
                        Ok(region) => {
                            if let Some(old) = live.remove(*id) {
                                free(*id, old)?;
                            }
                            log::debug!("new allocation: id{id} -> {region}");
                            assert_fits_request(&live, region, request)?;
                            live.insert(
                                *id,
                                LiveRegion {
                                    region,
                                    host_visible: request.host_visible,
                                    maps: vec![],
                                    contents: None,
                                },
                            );
                        }
                        // Running out of device allocations is allowed.
                        Err(Error::AllocationExhausted { .. }) => {}
                        Err(e) => return Err(format!("allocation failed: {e}")),
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        free(*id, alloc)?;
                    }
                }

                Op::Bind { id } => {
                    if let Some(alloc) = live.map.get_mut(id) {
                        let result = allocator.bind(&alloc.region);
                        if alloc.host_visible {
                            let map = result.map_err(|e| format!("bind failed: {e}"))?;
                            ensure!(map.region() == alloc.region, "mapped the wrong region");
                            ensure!(allocator.is_bound(&alloc.region), "bound region not bound");
                            alloc.maps.push(map);
                        } else {
                            ensure!(
                                matches!(result, Err(Error::MappingFailure { .. })),
                                "binding device-local memory gave {result:?}",
                            );
                        }
                    }
                }

                Op::Unbind { id } => {
                    if let Some(alloc) = live.map.get_mut(id) {
                        let result = allocator.unbind(&alloc.region);
                        if alloc.maps.pop().is_some() {
                            result.map_err(|e| format!("unbind failed: {e}"))?;
                        } else {
                            ensure!(
                                matches!(
                                    result,
                                    Err(Error::InvalidRegion {
                                        reason: InvalidRegionReason::NotBound,
                                        ..
                                    })
                                ),
                                "unbinding an unbound region gave {result:?}",
                            );
                        }
                    }
                }

                Op::Write { id, byte } => {
                    if let Some(alloc) = live.map.get_mut(id) {
                        if let Some(map) = alloc.maps.last() {
                            unsafe { map.write_bytes(0, &vec![*byte; map.len()]) };
                            alloc.contents = Some(*byte);
                        }
                    }
                }

                Op::Check { id } => {
                    if let Some(alloc) = live.map.get(id) {
                        if let (Some(map), Some(expected)) = (alloc.maps.last(), alloc.contents) {
                            let mut bytes = vec![LIVE_POISON_PATTERN; map.len()];
                            unsafe { map.read_bytes(0, &mut bytes) };
                            ensure!(
                                bytes.iter().all(|b| *b == expected),
                                "contents of {} were clobbered; expected {expected:#x}",
                                alloc.region,
                            );
                        }
                    }
                }
            }

            assert_stats(&live)?;
        }

        // Finally, free any remaining live allocations.
        for (id, alloc) in std::mem::take(&mut live.map) {
            free(id, alloc)?;
        }
        live.total_allocated_bytes = 0;
        assert_stats(&live)?;
        for s in allocator.stats() {
            ensure!(s.live_regions == 0, "regions left over: {s:?}");
            ensure!(s.gap_count == 0, "gaps left over in an empty slab: {s:?}");
        }

        Ok(())
    }
}

// Poison patterns for bytes we read back, so that memory which happens to be
// zeroed does not make a check pass by accident.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live region.
struct LiveRegion {
    region: Region,
    /// Was the region allocated from host-visible memory?
    host_visible: bool,
    /// One mapping per outstanding bind.
    maps: Vec<MappedRegion>,
    /// The byte the region was last filled with, if it was.
    contents: Option<u8>,
}

impl std::fmt::Debug for LiveRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRegion")
            .field("region", &format_args!("{}", self.region))
            .field("host_visible", &self.host_visible)
            .field("binds", &self.maps.len())
            .field("contents", &self.contents)
            .finish()
    }
}

/// The set of currently-live regions, keyed by ID.
struct LiveMap {
    /// The live regions themselves.
    map: BTreeMap<u32, LiveRegion>,

    /// The total number of bytes that are currently allocated.
    total_allocated_bytes: u64,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: u64,
}

impl LiveMap {
    fn new(allocation_limit: u64) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation limit?
    fn beyond_allocation_limit(&self, size: u64) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live region.
    ///
    /// It is the caller's responsibility to check that the given region fits
    /// within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveRegion) {
        self.total_allocated_bytes += alloc.region.width();
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and free old entries before adding new ones"
        );
    }

    /// Remove a live region for freeing.
    fn remove(&mut self, id: u32) -> Option<LiveRegion> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.region.width();
        Some(alloc)
    }
}
