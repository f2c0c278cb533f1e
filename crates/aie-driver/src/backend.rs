//! Command seam between the I/O engine and whatever owns the partition fd.
//!
//! [`PartitionBackend`] is the full set of kernel-side operations the engine
//! needs. Production code uses [`crate::partition::Partition`]; tests drive
//! the same engine against an in-memory fake.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use aie_chip::TileLoc;

use crate::error::{AieError, Result};
use crate::mapping::MappedRegion;
use crate::uapi::SHIM_DMA_BD_WORDS;

/// One host-mappable tile memory as reported by the kernel.
#[derive(Debug)]
pub struct MemoryDescriptor {
    /// Intra-tile offset of the memory class.
    pub offset: u64,
    /// Per-tile size in bytes.
    pub size: u64,
    /// Rows the memory spans.
    pub rows: u32,
    /// Columns the memory spans.
    pub cols: u32,
    /// Fd the concatenated region is mapped from.
    pub fd: std::os::fd::OwnedFd,
}

/// Where a shim DMA descriptor's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdTarget {
    /// Process virtual address, pinned by the kernel on submit.
    VirtAddr(u64),
    /// A dma-buf previously attached to the partition.
    DmaBuf(RawFd),
}

/// Cycle counts one tile accumulated over a utilization window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleCounts {
    /// Cycles the core spent executing.
    pub active_cycles: u64,
    /// Cycles elapsed in the window.
    pub total_cycles: u64,
}

/// Operations a partition owner must provide to the I/O engine.
pub trait PartitionBackend: Send + Sync + std::fmt::Debug {
    /// Map `len` bytes of the partition's register space read-only.
    fn map_registers(&self, len: usize) -> Result<MappedRegion>;

    /// Enumerate the partition's host-mappable tile memories.
    fn memory_descriptors(&self) -> Result<Vec<MemoryDescriptor>>;

    /// 32-bit register store; a nonzero `mask` makes it a read-modify-write.
    fn reg_write(&self, offset: u64, mask: u32, value: u32) -> Result<()>;

    /// Ungate the listed tiles.
    fn request_tiles(&self, locs: &[TileLoc]) -> Result<()>;

    /// Gate the listed tiles.
    fn release_tiles(&self, locs: &[TileLoc]) -> Result<()>;

    /// Initialize the partition, bringing up `locs` (all tiles when empty)
    /// with the given `AIE_PART_INIT_OPT_*` bits.
    fn init_partition(&self, opts: u32, locs: &[TileLoc]) -> Result<()>;

    /// Reset and gate everything in the partition.
    fn teardown_partition(&self) -> Result<()>;

    /// Drop the kernel's software context without touching hardware state.
    fn clear_context(&self) -> Result<()>;

    /// Enable or disable the clocks of a column span.
    fn set_column_clock(&self, start_col: u32, num_cols: u32, enable: bool) -> Result<()>;

    /// Attach a dma-buf so descriptors can reference it.
    fn attach_dma_buffer(&self, fd: BorrowedFd<'_>) -> Result<()>;

    /// Detach a previously attached dma-buf.
    fn detach_dma_buffer(&self, fd: BorrowedFd<'_>) -> Result<()>;

    /// Program a shim DMA buffer descriptor.
    fn set_shim_dma_bd(
        &self,
        loc: TileLoc,
        bd_id: u32,
        words: &[u32; SHIM_DMA_BD_WORDS],
        target: BdTarget,
    ) -> Result<()>;

    /// Rewrite only the address fields of a programmed dma-buf descriptor.
    fn update_shim_dma_bd_addr(
        &self,
        loc: TileLoc,
        bd_id: u32,
        buf_fd: RawFd,
        offset: u64,
    ) -> Result<()>;

    /// Submit a serialized command batch.
    fn submit_transaction(&self, num_cmds: u32, cmds: &[u8]) -> Result<()>;

    /// Allocate `count` performance counters in a core tile, returning
    /// their hardware ids.
    fn request_perf_counters(&self, loc: TileLoc, count: u32) -> Result<Vec<u32>>;

    /// Release one performance counter.
    fn release_perf_counter(&self, loc: TileLoc, id: u32) -> Result<()>;

    /// Ask the device which core tiles currently have their clocks enabled.
    /// Utilization sessions measure exactly this set.
    fn enabled_core_tiles(&self) -> Result<Vec<TileLoc>>;

    /// Measure core occupancy of `tiles` over `window`, returning counts in
    /// the same order. Blocks for at least the window. The tiles must hold
    /// performance counters requested beforehand.
    fn capture_utilization(&self, tiles: &[TileLoc], window: Duration) -> Result<Vec<CycleCounts>>;

    /// Hand a dma-buf back to the CPU domain before reading it.
    fn sync_for_cpu(&self, _fd: BorrowedFd<'_>) -> Result<()> {
        Err(AieError::NotSupported { op: "sync_for_cpu" })
    }

    /// Hand a dma-buf to the device domain before a transfer.
    fn sync_for_device(&self, _fd: BorrowedFd<'_>) -> Result<()> {
        Err(AieError::NotSupported {
            op: "sync_for_device",
        })
    }
}
