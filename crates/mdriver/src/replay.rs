//! Trace replay with correctness checks.

use std::{collections::BTreeMap, ptr::NonNull};

use log::{debug, trace};
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tagalloc::{
    Allocator, Config, CorruptionError, ResizeError,
    block::ALIGNMENT,
    provider::{AddressSpace as _, OwnedRegion},
};

use crate::trace::{Op, Trace};

#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    pub config: Config,
    /// Bytes reserved for the simulated address space.
    pub capacity: usize,
    /// Run the heap checker after every operation.
    pub check: bool,
    /// Dump every block when checking.
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub ops: usize,
    /// Largest total of live payload bytes at any point.
    pub peak_payload: usize,
    pub heap_size: usize,
}

impl ReplayStats {
    /// Ratio of peak live payload to final heap size.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.heap_size == 0 {
            return 0.0;
        }
        #[expect(clippy::cast_precision_loss)]
        let ratio = self.peak_payload as f64 / self.heap_size as f64;
        ratio
    }
}

#[derive(Debug, Snafu)]
pub enum ReplayError {
    #[snafu(display("failed to reserve {capacity} bytes of address space"))]
    Reserve { capacity: usize },
    #[snafu(display("op {index}: allocation of {size} bytes for id {id} failed"))]
    AllocationFailed { index: usize, id: usize, size: usize },
    #[snafu(display("op {index}: resize of id {id} to {size} bytes failed"))]
    ResizeFailed {
        index: usize,
        id: usize,
        size: usize,
        #[snafu(source)]
        source: ResizeError,
    },
    #[snafu(display("op {index}: id {id} is out of range: num_ids={num_ids}"))]
    UnknownId {
        index: usize,
        id: usize,
        num_ids: usize,
    },
    #[snafu(display("op {index}: id {id} is already allocated"))]
    AlreadyAllocated { index: usize, id: usize },
    #[snafu(display("op {index}: id {id} is not allocated"))]
    NotAllocated { index: usize, id: usize },
    #[snafu(display("op {index}: block {address:#x} for id {id} is not 8-byte aligned"))]
    Misaligned {
        index: usize,
        id: usize,
        address: usize,
    },
    #[snafu(display(
        "op {index}: block {address:#x}+{size} for id {id} lies outside the heap"
    ))]
    OutOfHeap {
        index: usize,
        id: usize,
        address: usize,
        size: usize,
    },
    #[snafu(display("op {index}: block {address:#x} for id {id} overlaps the block of id {other}"))]
    Overlap {
        index: usize,
        id: usize,
        address: usize,
        other: usize,
    },
    #[snafu(display("op {index}: payload of id {id} was overwritten at offset {offset}"))]
    PayloadCorrupted {
        index: usize,
        id: usize,
        offset: usize,
    },
    #[snafu(display("op {index}: heap check failed"))]
    Check {
        index: usize,
        #[snafu(source)]
        source: CorruptionError,
    },
}

#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: NonNull<u8>,
    size: usize,
}

fn fill_byte(id: usize) -> u8 {
    #[expect(clippy::cast_possible_truncation)]
    let byte = id as u8;
    byte ^ 0xA5
}

fn verify_payload(index: usize, id: usize, live: Live, len: usize) -> Result<(), ReplayError> {
    let fill = fill_byte(id);
    let bytes = unsafe { std::slice::from_raw_parts(live.ptr.as_ptr(), len) };
    if let Some(offset) = bytes.iter().position(|&b| b != fill) {
        return PayloadCorruptedSnafu { index, id, offset }.fail();
    }
    Ok(())
}

struct Replayer<'a> {
    options: &'a ReplayOptions,
    allocator: Allocator<OwnedRegion>,
    live: Vec<Option<Live>>,
    /// Live payload ranges: start address => (end address, id).
    ranges: BTreeMap<usize, (usize, usize)>,
    payload: usize,
    peak_payload: usize,
}

impl Replayer<'_> {
    fn slot(&mut self, index: usize, id: usize) -> Result<&mut Option<Live>, ReplayError> {
        let num_ids = self.live.len();
        self.live
            .get_mut(id)
            .context(UnknownIdSnafu { index, id, num_ids })
    }

    fn take(&mut self, index: usize, id: usize) -> Result<Live, ReplayError> {
        let live = self
            .slot(index, id)?
            .take()
            .context(NotAllocatedSnafu { index, id })?;
        verify_payload(index, id, live, live.size)?;
        self.ranges.remove(&live.ptr.addr().get());
        self.payload -= live.size;
        Ok(live)
    }

    /// Checks a freshly returned block and records it as live.
    fn admit(&mut self, index: usize, id: usize, live: Live) -> Result<(), ReplayError> {
        let address = live.ptr.addr().get();
        let size = live.size;
        ensure!(
            address.is_multiple_of(ALIGNMENT),
            MisalignedSnafu { index, id, address }
        );

        let space = self.allocator.space();
        let low = space.low_address().addr();
        let high = space.high_address().addr();
        ensure!(
            address >= low && address + size <= high.wrapping_add(1),
            OutOfHeapSnafu {
                index,
                id,
                address,
                size,
            }
        );

        let end = address + size;
        if let Some((_, &(prev_end, other))) = self.ranges.range(..=address).next_back() {
            ensure!(
                prev_end <= address,
                OverlapSnafu {
                    index,
                    id,
                    address,
                    other,
                }
            );
        }
        if let Some((&next_start, &(_, other))) = self.ranges.range(address..).next() {
            ensure!(
                end <= next_start,
                OverlapSnafu {
                    index,
                    id,
                    address,
                    other,
                }
            );
        }

        *self.slot(index, id)? = Some(live);
        unsafe { live.ptr.write_bytes(fill_byte(id), size) };
        self.ranges.insert(address, (end, id));
        self.payload += size;
        self.peak_payload = self.peak_payload.max(self.payload);
        Ok(())
    }

    fn step(&mut self, index: usize, op: Op) -> Result<(), ReplayError> {
        trace!("op {index}: {op:?}");
        match op {
            Op::Allocate { id, size } => {
                let slot = self.slot(index, id)?;
                ensure!(slot.is_none(), AlreadyAllocatedSnafu { index, id });
                if size == 0 {
                    *slot = Some(Live {
                        ptr: NonNull::dangling(),
                        size: 0,
                    });
                    return Ok(());
                }
                let ptr = self
                    .allocator
                    .allocate(size)
                    .context(AllocationFailedSnafu { index, id, size })?;
                self.admit(index, id, Live { ptr, size })?;
            }
            Op::Resize { id, size } => {
                let old = self.take(index, id)?;
                if old.size == 0 || size == 0 {
                    // nothing to preserve; behaves as release then allocate
                    if old.size > 0 {
                        unsafe { self.allocator.release(old.ptr.as_ptr()) };
                    }
                    return self.step(index, Op::Allocate { id, size });
                }
                let ptr = unsafe { self.allocator.resize(old.ptr, size) }
                    .context(ResizeFailedSnafu { index, id, size })?;
                let new = Live { ptr, size };
                verify_payload(index, id, new, old.size.min(size))?;
                self.admit(index, id, new)?;
            }
            Op::Release { id } => {
                let live = self.take(index, id)?;
                if live.size > 0 {
                    unsafe { self.allocator.release(live.ptr.as_ptr()) };
                }
            }
        }

        if self.options.check {
            self.allocator
                .verify()
                .context(CheckSnafu { index })?;
            if self.options.verbose {
                self.allocator.check_heap(true);
            }
        }
        Ok(())
    }
}

/// Replays `trace` on a fresh allocator.
pub fn replay(trace: &Trace, options: &ReplayOptions) -> Result<ReplayStats, ReplayError> {
    let region = OwnedRegion::new(options.capacity).context(ReserveSnafu {
        capacity: options.capacity,
    })?;
    let mut replayer = Replayer {
        options,
        allocator: Allocator::new(region, options.config),
        live: vec![None; trace.num_ids],
        ranges: BTreeMap::new(),
        payload: 0,
        peak_payload: 0,
    };

    for (index, &op) in trace.ops.iter().enumerate() {
        replayer.step(index, op)?;
    }

    let heap_size = replayer.allocator.heap_size();
    debug!(
        "replayed {} operations, heap size {heap_size} bytes",
        trace.ops.len()
    );
    Ok(ReplayStats {
        ops: trace.ops.len(),
        peak_payload: replayer.peak_payload,
        heap_size,
    })
}
