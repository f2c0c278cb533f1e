//! The partition I/O engine.
//!
//! [`AieIo`] owns one partition end to end: the read-only register mapping,
//! the tile memory mappings, the gating bitmap mirroring which tiles are
//! clocked, and the backend that carries privileged operations into the
//! kernel. Reads go straight through the mapping; writes cross the ioctl
//! boundary so the kernel can arbitrate them.

use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aie_chip::{partition_id, ArrayTopology, ColRange, TileLoc, TileType};
use tracing::{debug, info};

use crate::backend::PartitionBackend;
use crate::bitmap::GatingBitmap;
use crate::device::AieDevice;
use crate::error::{AieError, Result};
use crate::mapping::{MappedRegion, TileMemories};
use crate::mem::{ExternalMemory, ShimDmaBd, ShimDmaBdConfig};
use crate::partition::Partition;
use crate::perf::UtilizationSession;
use crate::txn::Transaction;
use crate::uapi::AIE_PART_INIT_OPT_DEFAULT;

/// Interval between reads of a polled register.
const POLL_INTERVAL_US: u32 = 200;

/// How to acquire the partition when opening an [`AieIo`].
#[derive(Debug, Default)]
pub struct IoConfig {
    /// First column of the partition to claim.
    pub start_col: u32,
    /// `AIE_PART_REQ_*` flags passed to the claim.
    pub partition_flags: u32,
    /// An already-open partition fd to adopt instead of claiming one, e.g.
    /// received from a resource manager over an fd-passing socket.
    pub partition: Option<OwnedFd>,
}

/// Explicit initialization request for [`AieIo::initialize`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// `AIE_PART_INIT_OPT_*` bits.
    pub flags: u32,
    /// Tiles to bring up; empty means the whole partition.
    pub tiles: Vec<TileLoc>,
}

/// I/O engine over one tile-array partition.
#[derive(Debug)]
pub struct AieIo {
    topology: ArrayTopology,
    backend: Arc<dyn PartitionBackend>,
    regs: MappedRegion,
    mems: TileMemories,
    tiles_in_use: GatingBitmap,
    util_active: Arc<AtomicBool>,
    // Keeps the device node open while its partition is live.
    _device: Option<AieDevice>,
}

impl AieIo {
    /// Open the array device, claim (or adopt) a partition of
    /// `topology.num_cols` columns, and map its register and memory spaces.
    pub fn open(topology: ArrayTopology, config: IoConfig) -> Result<Self> {
        match config.partition {
            Some(fd) => {
                debug!("adopting partition fd");
                Self::assemble(topology, Arc::new(Partition::from_fd(fd)), None)
            }
            None => {
                let device = AieDevice::open()?;
                let id = partition_id(config.start_col, topology.num_cols);
                let partition = device.request_partition(id, config.partition_flags)?;
                Self::assemble(topology, Arc::new(partition), Some(device))
            }
        }
    }

    /// Build the engine over an arbitrary backend. This is the seam used by
    /// tests and by out-of-process transports.
    pub fn with_backend(
        topology: ArrayTopology,
        backend: Arc<dyn PartitionBackend>,
    ) -> Result<Self> {
        Self::assemble(topology, backend, None)
    }

    fn assemble(
        topology: ArrayTopology,
        backend: Arc<dyn PartitionBackend>,
        device: Option<AieDevice>,
    ) -> Result<Self> {
        let regs_len = usize::try_from(u64::from(topology.num_cols) * topology.col_span())
            .map_err(|_| AieError::invalid_argument("partition register span overflows"))?;
        let regs = backend.map_registers(regs_len)?;
        let mems = TileMemories::discover(backend.as_ref(), &topology)?;
        // Until told otherwise, assume the kernel left every tile clocked.
        let mut tiles_in_use = GatingBitmap::new(&topology);
        tiles_in_use.set_all();
        info!(
            cols = topology.num_cols,
            rows = topology.num_rows,
            regs_len,
            "partition mapped"
        );
        Ok(Self {
            topology,
            backend,
            regs,
            mems,
            tiles_in_use,
            util_active: Arc::new(AtomicBool::new(false)),
            _device: device,
        })
    }

    /// The partition's topology.
    pub fn topology(&self) -> &ArrayTopology {
        &self.topology
    }

    /// Whether a tile's clocks are on according to the driver's bookkeeping.
    pub fn is_tile_in_use(&self, loc: TileLoc) -> bool {
        loc.row == 0 || self.tiles_in_use.tile_is_set(&self.topology, loc)
    }

    fn check_gated(&self, offset: u64) -> Result<()> {
        let loc = TileLoc::new(self.topology.row_of(offset), self.topology.col_of(offset));
        if !self.is_tile_in_use(loc) {
            return Err(AieError::TileGated {
                row: loc.row,
                col: loc.col,
            });
        }
        Ok(())
    }

    fn check_loc(&self, loc: TileLoc) -> Result<TileType> {
        self.topology.tile_type(loc).ok_or_else(|| {
            AieError::invalid_argument(format!("tile {loc} outside the partition"))
        })
    }

    fn check_span(&self, offset: u64, len: u64) -> Result<usize> {
        let limit = self.regs.len() as u64;
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(offset as usize),
            _ => Err(AieError::OutOfBounds { offset, len, limit }),
        }
    }

    /// A read that touches a tile's memory window must lie inside it
    /// entirely; straddling either edge of the window is rejected.
    fn check_read_window(&self, offset: u64) -> Result<()> {
        let loc = TileLoc::new(self.topology.row_of(offset), self.topology.col_of(offset));
        let window = match self.topology.tile_type(loc) {
            Some(TileType::Core) => {
                (self.topology.mems.data_mem_addr, self.topology.mems.data_mem_size)
            }
            Some(TileType::MemTile) => (
                self.topology.mems.mem_tile_mem_addr,
                self.topology.mems.mem_tile_mem_size,
            ),
            _ => return Ok(()),
        };
        let local = self.topology.local_addr(offset);
        let (base, size) = window;
        let overlaps = local < base + size && local + 4 > base;
        let contained = local >= base && local + 4 <= base + size;
        if overlaps && !contained {
            return Err(AieError::OutOfBounds {
                offset,
                len: 4,
                limit: base + size,
            });
        }
        Ok(())
    }

    /// 32-bit register read through the mapped register space.
    pub fn read32(&self, offset: u64) -> Result<u32> {
        self.check_span(offset, 4)?;
        self.check_gated(offset)?;
        self.check_read_window(offset)?;
        self.regs.read_u32(offset as usize)
    }

    /// 32-bit register write.
    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.check_span(offset, 4)?;
        self.check_gated(offset)?;
        self.backend.reg_write(offset, 0, value)
    }

    /// Masked 32-bit register write; bits outside `mask` are preserved.
    pub fn mask_write32(&self, offset: u64, mask: u32, value: u32) -> Result<()> {
        self.check_span(offset, 4)?;
        self.check_gated(offset)?;
        self.backend.reg_write(offset, mask, value)
    }

    /// Poll a register until `(value & mask) == expected`, reading every
    /// 200us for at most `timeout_us` and once more after the budget.
    pub fn mask_poll(&self, offset: u64, mask: u32, expected: u32, timeout_us: u32) -> Result<()> {
        let mut remaining = timeout_us.div_ceil(POLL_INTERVAL_US);
        while remaining > 0 {
            if self.read32(offset)? & mask == expected {
                return Ok(());
            }
            thread::sleep(Duration::from_micros(u64::from(POLL_INTERVAL_US)));
            remaining -= 1;
        }
        if self.read32(offset)? & mask == expected {
            return Ok(());
        }
        Err(AieError::Timeout { offset, timeout_us })
    }

    fn block_window(&self, offset: u64, len: u64) -> Result<Option<(&MappedRegion, usize)>> {
        self.check_span(offset, len)?;
        self.check_gated(offset)?;
        let loc = TileLoc::new(self.topology.row_of(offset), self.topology.col_of(offset));
        let tile_type = self.check_loc(loc)?;
        let local = self.topology.local_addr(offset);
        Ok(self
            .mems
            .window(&self.topology, tile_type, loc, local, len))
    }

    /// Write a word block, going through the mapped tile memory when the
    /// span lies in one, register by register otherwise.
    pub fn block_write32(&self, offset: u64, data: &[u32]) -> Result<()> {
        match self.block_window(offset, data.len() as u64 * 4)? {
            Some((region, off)) => region.write_words(off, data),
            None => {
                for (i, word) in data.iter().enumerate() {
                    self.backend.reg_write(offset + i as u64 * 4, 0, *word)?;
                }
                Ok(())
            }
        }
    }

    /// Fill `count` words with `value`, same path selection as
    /// [`Self::block_write32`].
    pub fn block_set32(&self, offset: u64, value: u32, count: usize) -> Result<()> {
        match self.block_window(offset, count as u64 * 4)? {
            Some((region, off)) => region.fill_words(off, value, count),
            None => {
                for i in 0..count {
                    self.backend.reg_write(offset + i as u64 * 4, 0, value)?;
                }
                Ok(())
            }
        }
    }

    /// Initialize the partition.
    ///
    /// Without options the kernel applies its default bring-up to every
    /// tile and the bookkeeping marks the whole array in use. With options,
    /// each requested tile marks its column in use from row 1 up to it,
    /// since the rows beneath a clocked tile must be clocked to reach it.
    pub fn initialize(&mut self, opts: Option<&InitOptions>) -> Result<()> {
        self.tiles_in_use.clear_all();
        match opts {
            None => {
                self.backend
                    .init_partition(AIE_PART_INIT_OPT_DEFAULT, &[])?;
                self.tiles_in_use.set_all();
            }
            Some(opts) => {
                for loc in &opts.tiles {
                    self.check_loc(*loc)?;
                }
                self.backend.init_partition(opts.flags, &opts.tiles)?;
                for loc in &opts.tiles {
                    for row in 1..=loc.row {
                        let pos = self.topology.tile_bit_pos(TileLoc::new(row, loc.col));
                        self.tiles_in_use.set_range(pos, 1);
                    }
                }
            }
        }
        Ok(())
    }

    /// Ungate a set of tiles; an empty list means the whole partition.
    pub fn request_tiles(&mut self, locs: &[TileLoc]) -> Result<()> {
        for loc in locs {
            self.check_loc(*loc)?;
        }
        self.tiles_in_use.clear_all();
        self.backend.request_tiles(locs)?;
        if locs.is_empty() {
            self.tiles_in_use.set_all();
        } else {
            for loc in locs {
                if loc.row > 0 {
                    let pos = self.topology.tile_bit_pos(*loc);
                    self.tiles_in_use.set_range(pos, 1);
                }
            }
        }
        Ok(())
    }

    /// Gate a set of tiles. The kernel decides what actually powers down;
    /// the bookkeeping is refreshed on the next request or initialize.
    pub fn release_tiles(&mut self, locs: &[TileLoc]) -> Result<()> {
        for loc in locs {
            self.check_loc(*loc)?;
        }
        self.backend.release_tiles(locs)
    }

    /// Enable or disable the clocks of a column span, updating bookkeeping
    /// to match.
    pub fn set_column_clock(&mut self, cols: ColRange, enable: bool) -> Result<()> {
        if cols.start + cols.num > self.topology.num_cols {
            return Err(AieError::invalid_argument(format!(
                "columns {}..{} outside the partition",
                cols.start,
                cols.start + cols.num
            )));
        }
        self.backend.set_column_clock(cols.start, cols.num, enable)?;
        let rows = self.topology.num_rows - 1;
        for col in cols.start..cols.start + cols.num {
            let pos = self.topology.tile_bit_pos(TileLoc::new(1, col));
            if enable {
                self.tiles_in_use.set_range(pos, rows);
            } else {
                self.tiles_in_use.clear_range(pos, rows);
            }
        }
        Ok(())
    }

    /// Reset and gate the whole partition.
    pub fn teardown(&mut self) -> Result<()> {
        self.backend.teardown_partition()?;
        self.tiles_in_use.clear_all();
        Ok(())
    }

    /// Drop the kernel's software context for the partition without
    /// touching hardware state.
    pub fn clear_context(&self) -> Result<()> {
        self.backend.clear_context()
    }

    /// Attach a dma-buf for shim DMA descriptor use.
    pub fn attach_memory(&self, fd: OwnedFd, size: u64) -> Result<ExternalMemory> {
        ExternalMemory::attach(Arc::clone(&self.backend), fd, size)
    }

    /// Program a shim DMA descriptor into a shim tile's engine.
    pub fn program_shim_bd(&self, bd: &ShimDmaBd, loc: TileLoc, bd_id: u32) -> Result<()> {
        bd.program(self.backend.as_ref(), loc, bd_id)
    }

    /// Program a slot-bound shim DMA descriptor config.
    pub fn program_shim_bd_config(&self, config: &ShimDmaBdConfig) -> Result<()> {
        config.program(self.backend.as_ref())
    }

    /// Submit a serialized command batch.
    pub fn submit(&self, txn: &Transaction) -> Result<()> {
        txn.submit(self.backend.as_ref())
    }

    /// Start measuring core utilization over `window`. The device reports
    /// which core tiles are clocked and the session measures exactly that
    /// set; only one session may run at a time.
    pub fn start_utilization(&self, window: Duration) -> Result<UtilizationSession> {
        let tiles = self.backend.enabled_core_tiles()?;
        UtilizationSession::start(
            Arc::clone(&self.backend),
            &tiles,
            window,
            Arc::clone(&self.util_active),
        )
    }
}
