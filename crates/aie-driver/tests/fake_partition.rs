//! End-to-end tests of the I/O engine against an in-memory backend.
//!
//! The fake serves the register space and tile memories out of memfds. The
//! engine maps the register memfd read-only, exactly as it would the real
//! partition fd, while the fake applies `reg_write` through its own
//! read-write view of the same memfd. Writes through the command seam are
//! therefore observable through the engine's ordinary read path.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use rustix::fs::{ftruncate, memfd_create, MemfdFlags};

use aie_chip::{ArrayTopology, ColRange, TileLoc};
use aie_driver::backend::{BdTarget, CycleCounts, MemoryDescriptor, PartitionBackend};
use aie_driver::mapping::{Access, MappedRegion};
use aie_driver::uapi::{AIE_PART_INIT_OPT_DEFAULT, SHIM_DMA_BD_WORDS};
use aie_driver::{AieError, AieIo, InitOptions, IoConfig, ShimDmaBd, Transaction};

const PERF_COUNTERS_PER_TILE: u32 = 4;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn memfd(name: &str, len: u64) -> Result<OwnedFd> {
    let fd = memfd_create(name, MemfdFlags::CLOEXEC)?;
    ftruncate(&fd, len)?;
    Ok(fd)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Init { opts: u32, tiles: Vec<TileLoc> },
    RequestTiles(Vec<TileLoc>),
    ReleaseTiles(Vec<TileLoc>),
    Teardown,
    ClearContext,
    ColumnClock { start: u32, num: u32, enable: bool },
    Attach(RawFd),
    Detach(RawFd),
    ShimBd { loc: TileLoc, bd_id: u32, target: BdTarget, first_word: u32 },
    ShimBdAddr { loc: TileLoc, bd_id: u32, fd: RawFd, offset: u64 },
    Transaction { num_cmds: u32, len: usize },
}

#[derive(Debug)]
struct FakeMem {
    offset: u64,
    size: u64,
    rows: u32,
    cols: u32,
    fd: OwnedFd,
    view: MappedRegion,
}

impl FakeMem {
    fn new(name: &str, offset: u64, size: u64, rows: u32, cols: u32) -> Result<Self> {
        let len = size * u64::from(rows) * u64::from(cols);
        let fd = memfd(name, len)?;
        let view = MappedRegion::map(
            unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) },
            len as usize,
            Access::ReadWrite,
        )?;
        Ok(Self { offset, size, rows, cols, fd, view })
    }

    fn descriptor(&self) -> Result<MemoryDescriptor> {
        Ok(MemoryDescriptor {
            offset: self.offset,
            size: self.size,
            rows: self.rows,
            cols: self.cols,
            fd: self.fd.try_clone()?,
        })
    }
}

#[derive(Debug)]
struct FakePartition {
    topo: ArrayTopology,
    regs_fd: OwnedFd,
    regs: MappedRegion,
    mems: Vec<FakeMem>,
    events: Mutex<Vec<Event>>,
    // Performance counters handed out, per tile.
    counters: Mutex<HashMap<(u32, u32), u32>>,
    // Tiles whose clocks the device considers on, as (row, col).
    enabled: Mutex<HashSet<(u32, u32)>>,
}

impl FakePartition {
    fn new(topology: &ArrayTopology) -> Result<Self> {
        let regs_len = u64::from(topology.num_cols) * topology.col_span();
        let regs_fd = memfd("fake-regs", regs_len)?;
        let regs = MappedRegion::map(
            unsafe { BorrowedFd::borrow_raw(regs_fd.as_raw_fd()) },
            regs_len as usize,
            Access::ReadWrite,
        )?;
        let mems = vec![
            FakeMem::new(
                "fake-prog",
                topology.mems.prog_mem_host_offset,
                topology.mems.prog_mem_size,
                topology.core_num_rows,
                topology.num_cols,
            )?,
            FakeMem::new(
                "fake-data",
                topology.mems.data_mem_addr,
                topology.mems.data_mem_size,
                topology.core_num_rows,
                topology.num_cols,
            )?,
            FakeMem::new(
                "fake-memtile",
                topology.mems.mem_tile_mem_addr,
                topology.mems.mem_tile_mem_size,
                topology.mem_tile_num_rows,
                topology.num_cols,
            )?,
        ];
        Ok(Self {
            topo: *topology,
            regs_fd,
            regs,
            mems,
            events: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            enabled: Mutex::new(Self::every_tile(topology)),
        })
    }

    fn every_tile(topology: &ArrayTopology) -> HashSet<(u32, u32)> {
        let mut all = HashSet::new();
        for row in 1..topology.num_rows {
            for col in 0..topology.num_cols {
                all.insert((row, col));
            }
        }
        all
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn outstanding_counters(&self) -> u32 {
        self.counters.lock().unwrap().values().sum()
    }

    /// Raw view into a tile memory, for asserting where block writes land.
    fn mem_word(&self, index: usize, offset: usize) -> u32 {
        self.mems[index].view.read_u32(offset).unwrap()
    }
}

impl PartitionBackend for FakePartition {
    fn map_registers(&self, len: usize) -> aie_driver::Result<MappedRegion> {
        MappedRegion::map(
            unsafe { BorrowedFd::borrow_raw(self.regs_fd.as_raw_fd()) },
            len,
            Access::ReadOnly,
        )
    }

    fn memory_descriptors(&self) -> aie_driver::Result<Vec<MemoryDescriptor>> {
        self.mems
            .iter()
            .map(|m| {
                m.descriptor()
                    .map_err(|_| AieError::invalid_backend("descriptor clone failed"))
            })
            .collect()
    }

    fn reg_write(&self, offset: u64, mask: u32, value: u32) -> aie_driver::Result<()> {
        let offset = offset as usize;
        if mask == 0 {
            self.regs.write_u32(offset, value)
        } else {
            let old = self.regs.read_u32(offset)?;
            self.regs.write_u32(offset, (old & !mask) | (value & mask))
        }
    }

    fn request_tiles(&self, locs: &[TileLoc]) -> aie_driver::Result<()> {
        let mut enabled = self.enabled.lock().unwrap();
        if locs.is_empty() {
            *enabled = Self::every_tile(&self.topo);
        } else {
            for loc in locs {
                enabled.insert((loc.row, loc.col));
            }
        }
        drop(enabled);
        self.record(Event::RequestTiles(locs.to_vec()));
        Ok(())
    }

    fn release_tiles(&self, locs: &[TileLoc]) -> aie_driver::Result<()> {
        let mut enabled = self.enabled.lock().unwrap();
        for loc in locs {
            enabled.remove(&(loc.row, loc.col));
        }
        drop(enabled);
        self.record(Event::ReleaseTiles(locs.to_vec()));
        Ok(())
    }

    fn init_partition(&self, opts: u32, locs: &[TileLoc]) -> aie_driver::Result<()> {
        let mut enabled = self.enabled.lock().unwrap();
        if locs.is_empty() {
            *enabled = Self::every_tile(&self.topo);
        } else {
            enabled.clear();
            for loc in locs {
                for row in 1..=loc.row {
                    enabled.insert((row, loc.col));
                }
            }
        }
        drop(enabled);
        self.record(Event::Init {
            opts,
            tiles: locs.to_vec(),
        });
        Ok(())
    }

    fn teardown_partition(&self) -> aie_driver::Result<()> {
        self.enabled.lock().unwrap().clear();
        self.record(Event::Teardown);
        Ok(())
    }

    fn clear_context(&self) -> aie_driver::Result<()> {
        self.record(Event::ClearContext);
        Ok(())
    }

    fn set_column_clock(&self, start_col: u32, num_cols: u32, enable: bool) -> aie_driver::Result<()> {
        let mut enabled = self.enabled.lock().unwrap();
        for col in start_col..start_col + num_cols {
            for row in 1..self.topo.num_rows {
                if enable {
                    enabled.insert((row, col));
                } else {
                    enabled.remove(&(row, col));
                }
            }
        }
        drop(enabled);
        self.record(Event::ColumnClock {
            start: start_col,
            num: num_cols,
            enable,
        });
        Ok(())
    }

    fn attach_dma_buffer(&self, fd: BorrowedFd<'_>) -> aie_driver::Result<()> {
        self.record(Event::Attach(fd.as_raw_fd()));
        Ok(())
    }

    fn detach_dma_buffer(&self, fd: BorrowedFd<'_>) -> aie_driver::Result<()> {
        self.record(Event::Detach(fd.as_raw_fd()));
        Ok(())
    }

    fn set_shim_dma_bd(
        &self,
        loc: TileLoc,
        bd_id: u32,
        words: &[u32; SHIM_DMA_BD_WORDS],
        target: BdTarget,
    ) -> aie_driver::Result<()> {
        self.record(Event::ShimBd {
            loc,
            bd_id,
            target,
            first_word: words[0],
        });
        Ok(())
    }

    fn update_shim_dma_bd_addr(
        &self,
        loc: TileLoc,
        bd_id: u32,
        buf_fd: RawFd,
        offset: u64,
    ) -> aie_driver::Result<()> {
        self.record(Event::ShimBdAddr {
            loc,
            bd_id,
            fd: buf_fd,
            offset,
        });
        Ok(())
    }

    fn submit_transaction(&self, num_cmds: u32, cmds: &[u8]) -> aie_driver::Result<()> {
        self.record(Event::Transaction {
            num_cmds,
            len: cmds.len(),
        });
        Ok(())
    }

    fn request_perf_counters(&self, loc: TileLoc, count: u32) -> aie_driver::Result<Vec<u32>> {
        let mut held = self.counters.lock().unwrap();
        let used = held.entry((loc.row, loc.col)).or_insert(0);
        if *used + count > PERF_COUNTERS_PER_TILE {
            return Err(AieError::invalid_argument("perf counters exhausted"));
        }
        let ids = (*used..*used + count).collect();
        *used += count;
        Ok(ids)
    }

    fn release_perf_counter(&self, loc: TileLoc, _id: u32) -> aie_driver::Result<()> {
        let mut held = self.counters.lock().unwrap();
        match held.get_mut(&(loc.row, loc.col)) {
            Some(used) if *used > 0 => {
                *used -= 1;
                if *used == 0 {
                    held.remove(&(loc.row, loc.col));
                }
                Ok(())
            }
            _ => Err(AieError::invalid_argument("counter not held")),
        }
    }

    fn enabled_core_tiles(&self) -> aie_driver::Result<Vec<TileLoc>> {
        let enabled = self.enabled.lock().unwrap();
        let mut tiles = Vec::new();
        for col in 0..self.topo.num_cols {
            for row in
                self.topo.core_row_start..self.topo.core_row_start + self.topo.core_num_rows
            {
                if enabled.contains(&(row, col)) {
                    tiles.push(TileLoc::new(row, col));
                }
            }
        }
        Ok(tiles)
    }

    fn capture_utilization(
        &self,
        tiles: &[TileLoc],
        window: Duration,
    ) -> aie_driver::Result<Vec<CycleCounts>> {
        std::thread::sleep(window);
        Ok(tiles
            .iter()
            .map(|l| CycleCounts {
                active_cycles: u64::from(l.row * 10 + l.col).min(100),
                total_cycles: 100,
            })
            .collect())
    }
}

fn engine() -> Result<(AieIo, Arc<FakePartition>)> {
    init_tracing();
    let topology = ArrayTopology::aieml(2);
    let fake = Arc::new(FakePartition::new(&topology)?);
    let io = AieIo::with_backend(topology, Arc::clone(&fake) as Arc<dyn PartitionBackend>)?;
    Ok((io, fake))
}

/// Flat register offset of `local` within tile (row, col) of the test
/// topology.
fn offset(row: u32, col: u32, local: u64) -> u64 {
    ArrayTopology::aieml(2).tile_addr(TileLoc::new(row, col)) | local
}

#[test]
fn writes_round_trip_through_the_register_space() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.initialize(None)?;
    assert_eq!(
        fake.events()[0],
        Event::Init {
            opts: AIE_PART_INIT_OPT_DEFAULT,
            tiles: vec![]
        }
    );

    let off = offset(2, 1, 0x3_2000);
    io.write32(off, 0xDEAD_BEEF)?;
    assert_eq!(io.read32(off)?, 0xDEAD_BEEF);

    io.write32(off, 0xFFFF_0000)?;
    io.mask_write32(off, 0x0000_00FF, 0x12)?;
    assert_eq!(io.read32(off)?, 0xFFFF_0012);
    Ok(())
}

#[test]
fn default_init_ungates_everything() -> Result<()> {
    let (mut io, _fake) = engine()?;
    io.initialize(None)?;
    for row in 0..6 {
        for col in 0..2 {
            assert!(io.is_tile_in_use(TileLoc::new(row, col)), "({row},{col})");
        }
    }
    Ok(())
}

#[test]
fn targeted_init_ungates_each_column_up_to_its_tile() -> Result<()> {
    let (mut io, fake) = engine()?;
    let opts = InitOptions {
        flags: 0,
        tiles: vec![TileLoc::new(3, 1)],
    };
    io.initialize(Some(&opts))?;
    assert_eq!(
        fake.events()[0],
        Event::Init {
            opts: 0,
            tiles: vec![TileLoc::new(3, 1)]
        }
    );
    // Column 1 is clocked from row 1 up to row 3, nothing above, and
    // nothing in column 0.
    for row in 1..=3 {
        assert!(io.is_tile_in_use(TileLoc::new(row, 1)));
    }
    assert!(!io.is_tile_in_use(TileLoc::new(4, 1)));
    assert!(!io.is_tile_in_use(TileLoc::new(2, 0)));
    // Shim row is never gated.
    assert!(io.is_tile_in_use(TileLoc::new(0, 0)));

    assert!(matches!(
        io.read32(offset(2, 0, 0x3_2000)),
        Err(AieError::TileGated { row: 2, col: 0 })
    ));
    Ok(())
}

#[test]
fn tile_requests_replace_the_bookkeeping() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.request_tiles(&[TileLoc::new(2, 0)])?;
    assert!(io.is_tile_in_use(TileLoc::new(2, 0)));
    assert!(!io.is_tile_in_use(TileLoc::new(2, 1)));
    assert!(!io.is_tile_in_use(TileLoc::new(3, 0)));

    // An empty request means the whole partition.
    io.request_tiles(&[])?;
    assert!(io.is_tile_in_use(TileLoc::new(5, 1)));

    io.release_tiles(&[TileLoc::new(2, 0)])?;
    assert_eq!(
        fake.events(),
        vec![
            Event::RequestTiles(vec![TileLoc::new(2, 0)]),
            Event::RequestTiles(vec![]),
            Event::ReleaseTiles(vec![TileLoc::new(2, 0)]),
        ]
    );

    assert!(matches!(
        io.request_tiles(&[TileLoc::new(9, 0)]),
        Err(AieError::InvalidArgument { .. })
    ));
    Ok(())
}

#[test]
fn block_writes_land_in_mapped_tile_memory() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.initialize(None)?;
    let topo = *io.topology();

    // Core data memory of tile (2,1): fake mem index 1.
    let data: Vec<u32> = (0..64).map(|i| 0x1000_0000 + i).collect();
    io.block_write32(offset(2, 1, 0x100), &data)?;
    let unit = topo.mems.data_mem_size;
    let base = (u64::from(topo.core_num_rows) * unit + 0x100) as usize;
    for (i, want) in data.iter().enumerate() {
        assert_eq!(fake.mem_word(1, base + i * 4), *want);
    }

    // Program memory of tile (3,0): fake mem index 0.
    io.block_set32(offset(3, 0, 0x2_0010), 0xABAB_ABAB, 8)?;
    let unit = topo.mems.prog_mem_size;
    let base = (unit + 0x10) as usize;
    for i in 0..8 {
        assert_eq!(fake.mem_word(0, base + i * 4), 0xABAB_ABAB);
    }

    // Memory-tile memory of tile (1,1): fake mem index 2.
    io.block_write32(offset(1, 1, 0x40), &[7, 8, 9])?;
    let unit = topo.mems.mem_tile_mem_size;
    assert_eq!(fake.mem_word(2, (unit + 0x40) as usize), 7);
    assert_eq!(fake.mem_word(2, (unit + 0x48) as usize), 9);
    Ok(())
}

#[test]
fn block_writes_outside_mapped_memory_fall_back_to_registers() -> Result<()> {
    let (mut io, _fake) = engine()?;
    io.initialize(None)?;

    // Shim tiles expose no mapped memory, so the block goes word by word
    // through the register path and is visible to ordinary reads.
    let off = offset(0, 1, 0x1_4000);
    io.block_write32(off, &[1, 2, 3, 4])?;
    for i in 0..4u64 {
        assert_eq!(io.read32(off + i * 4)?, i as u32 + 1);
    }

    // Core-tile addresses beyond the memory windows fall back the same way.
    let off = offset(2, 0, 0x3_8000);
    io.block_set32(off, 0x55, 2)?;
    assert_eq!(io.read32(off)?, 0x55);
    assert_eq!(io.read32(off + 4)?, 0x55);
    Ok(())
}

#[test]
fn mask_poll_converges_and_times_out() -> Result<()> {
    let (mut io, _fake) = engine()?;
    io.initialize(None)?;
    let off = offset(2, 0, 0x3_2004);

    io.write32(off, 0x0000_0107)?;
    io.mask_poll(off, 0xFF, 0x07, 1000)?;

    assert!(matches!(
        io.mask_poll(off, 0xFF, 0x99, 400),
        Err(AieError::Timeout {
            timeout_us: 400,
            ..
        })
    ));
    Ok(())
}

#[test]
fn column_clock_updates_gating() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.initialize(None)?;

    io.set_column_clock(ColRange::new(1, 1), false)?;
    assert!(!io.is_tile_in_use(TileLoc::new(2, 1)));
    assert!(io.is_tile_in_use(TileLoc::new(2, 0)));
    assert!(matches!(
        io.read32(offset(4, 1, 0x3_2000)),
        Err(AieError::TileGated { .. })
    ));

    io.set_column_clock(ColRange::new(1, 1), true)?;
    assert!(io.is_tile_in_use(TileLoc::new(2, 1)));

    assert!(io.set_column_clock(ColRange::new(1, 2), true).is_err());
    assert!(fake
        .events()
        .contains(&Event::ColumnClock { start: 1, num: 1, enable: false }));
    Ok(())
}

#[test]
fn teardown_gates_the_partition() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.initialize(None)?;
    io.teardown()?;
    assert!(!io.is_tile_in_use(TileLoc::new(2, 0)));
    io.clear_context()?;
    assert!(fake.events().ends_with(&[Event::Teardown, Event::ClearContext]));
    Ok(())
}

#[test]
fn unclassifiable_memory_fails_bring_up() -> Result<()> {
    init_tracing();

    #[derive(Debug)]
    struct OddMem(FakePartition);
    impl PartitionBackend for OddMem {
        fn map_registers(&self, len: usize) -> aie_driver::Result<MappedRegion> {
            self.0.map_registers(len)
        }
        fn memory_descriptors(&self) -> aie_driver::Result<Vec<MemoryDescriptor>> {
            let mut descs = self.0.memory_descriptors()?;
            descs[0].offset = 0x666;
            Ok(descs)
        }
        fn reg_write(&self, o: u64, m: u32, v: u32) -> aie_driver::Result<()> {
            self.0.reg_write(o, m, v)
        }
        fn request_tiles(&self, l: &[TileLoc]) -> aie_driver::Result<()> {
            self.0.request_tiles(l)
        }
        fn release_tiles(&self, l: &[TileLoc]) -> aie_driver::Result<()> {
            self.0.release_tiles(l)
        }
        fn init_partition(&self, o: u32, l: &[TileLoc]) -> aie_driver::Result<()> {
            self.0.init_partition(o, l)
        }
        fn teardown_partition(&self) -> aie_driver::Result<()> {
            self.0.teardown_partition()
        }
        fn clear_context(&self) -> aie_driver::Result<()> {
            self.0.clear_context()
        }
        fn set_column_clock(&self, s: u32, n: u32, e: bool) -> aie_driver::Result<()> {
            self.0.set_column_clock(s, n, e)
        }
        fn attach_dma_buffer(&self, fd: BorrowedFd<'_>) -> aie_driver::Result<()> {
            self.0.attach_dma_buffer(fd)
        }
        fn detach_dma_buffer(&self, fd: BorrowedFd<'_>) -> aie_driver::Result<()> {
            self.0.detach_dma_buffer(fd)
        }
        fn set_shim_dma_bd(
            &self,
            l: TileLoc,
            b: u32,
            w: &[u32; SHIM_DMA_BD_WORDS],
            t: BdTarget,
        ) -> aie_driver::Result<()> {
            self.0.set_shim_dma_bd(l, b, w, t)
        }
        fn update_shim_dma_bd_addr(
            &self,
            l: TileLoc,
            b: u32,
            f: RawFd,
            o: u64,
        ) -> aie_driver::Result<()> {
            self.0.update_shim_dma_bd_addr(l, b, f, o)
        }
        fn submit_transaction(&self, n: u32, c: &[u8]) -> aie_driver::Result<()> {
            self.0.submit_transaction(n, c)
        }
        fn request_perf_counters(&self, l: TileLoc, c: u32) -> aie_driver::Result<Vec<u32>> {
            self.0.request_perf_counters(l, c)
        }
        fn release_perf_counter(&self, l: TileLoc, i: u32) -> aie_driver::Result<()> {
            self.0.release_perf_counter(l, i)
        }
        fn enabled_core_tiles(&self) -> aie_driver::Result<Vec<TileLoc>> {
            self.0.enabled_core_tiles()
        }
        fn capture_utilization(
            &self,
            t: &[TileLoc],
            w: Duration,
        ) -> aie_driver::Result<Vec<CycleCounts>> {
            self.0.capture_utilization(t, w)
        }
    }

    let topology = ArrayTopology::aieml(2);
    let fake = OddMem(FakePartition::new(&topology)?);
    let err = AieIo::with_backend(topology, Arc::new(fake)).unwrap_err();
    assert!(matches!(err, AieError::UnclassifiedMemory { offset: 0x666, .. }));
    Ok(())
}

#[test]
fn shim_descriptors_reach_the_backend() -> Result<()> {
    let (io, fake) = engine()?;

    let buf = memfd("payload", 0x1000)?;
    let mem = io.attach_memory(buf, 0x1000)?;
    let attached_fd = mem.fd().as_raw_fd();
    assert!(fake.events().contains(&Event::Attach(attached_fd)));

    let mut words = [0u32; SHIM_DMA_BD_WORDS];
    words[0] = 0x400; // transfer length
    let bd = ShimDmaBd::with_buffer(words, &mem)?;
    io.program_shim_bd(&bd, TileLoc::new(0, 1), 3)?;
    assert!(fake.events().contains(&Event::ShimBd {
        loc: TileLoc::new(0, 1),
        bd_id: 3,
        target: BdTarget::DmaBuf(attached_fd),
        first_word: 0x400,
    }));

    // Descriptors only land on shim tiles, in real slots.
    assert!(io.program_shim_bd(&bd, TileLoc::new(2, 0), 0).is_err());
    assert!(io.program_shim_bd(&bd, TileLoc::new(0, 0), 99).is_err());

    let va_bd = ShimDmaBd::with_virt_addr(words, 0xDEAD_0000);
    io.program_shim_bd(&va_bd, TileLoc::new(0, 0), 0)?;
    assert!(fake.events().contains(&Event::ShimBd {
        loc: TileLoc::new(0, 0),
        bd_id: 0,
        target: BdTarget::VirtAddr(0xDEAD_0000),
        first_word: 0x400,
    }));

    let mut mem = mem;
    mem.detach()?;
    assert!(fake.events().contains(&Event::Detach(attached_fd)));
    assert!(ShimDmaBd::with_buffer(words, &mem).is_err());
    assert!(mem.detach().is_err());
    Ok(())
}

#[test]
fn detach_happens_on_drop() -> Result<()> {
    let (io, fake) = engine()?;
    let buf = memfd("payload", 0x1000)?;
    let fd = {
        let mem = io.attach_memory(buf, 0x1000)?;
        mem.fd().as_raw_fd()
    };
    assert!(fake.events().contains(&Event::Detach(fd)));
    Ok(())
}

#[test]
fn transactions_are_submitted_whole() -> Result<()> {
    let (io, fake) = engine()?;
    let txn = Transaction::from_words(3, &[0x10, 0x20, 0x30, 0x40, 0x50, 0x60])?;
    io.submit(&txn)?;
    assert!(fake
        .events()
        .contains(&Event::Transaction { num_cmds: 3, len: 24 }));
    Ok(())
}

#[test]
fn utilization_sessions_measure_and_release() -> Result<()> {
    let (io, fake) = engine()?;

    let session = io.start_utilization(Duration::from_millis(100))?;
    // Only one session may be outstanding.
    assert!(io.start_utilization(Duration::from_millis(1)).is_err());

    let report = session.wait()?;
    // Every core tile of the 2-column array reports, with the fake's
    // deterministic active/total ratio.
    assert_eq!(report.len(), 8);
    for tile in &report {
        assert_eq!(u32::from(tile.percent), tile.loc.row * 10 + tile.loc.col);
    }
    assert_eq!(fake.outstanding_counters(), 0);

    // A finished session frees the slot.
    let again = io.start_utilization(Duration::from_millis(1))?;
    again.wait()?;
    assert_eq!(fake.outstanding_counters(), 0);
    Ok(())
}

#[test]
fn utilization_skips_gated_columns() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.initialize(None)?;
    io.set_column_clock(ColRange::new(1, 1), false)?;

    let report = io.start_utilization(Duration::from_millis(1))?.wait()?;
    assert_eq!(report.len(), 4);
    assert!(report.iter().all(|t| t.loc.col == 0));
    assert_eq!(fake.outstanding_counters(), 0);
    Ok(())
}

#[test]
fn initialize_is_idempotent_for_a_fixed_tile_list() -> Result<()> {
    let (mut io, _fake) = engine()?;
    let opts = InitOptions {
        flags: 0,
        tiles: vec![TileLoc::new(4, 0)],
    };
    io.initialize(Some(&opts))?;
    let first: Vec<bool> = (0..6)
        .flat_map(|row| (0..2).map(move |col| (row, col)))
        .map(|(row, col)| io.is_tile_in_use(TileLoc::new(row, col)))
        .collect();
    io.initialize(Some(&opts))?;
    let second: Vec<bool> = (0..6)
        .flat_map(|row| (0..2).map(move |col| (row, col)))
        .map(|(row, col)| io.is_tile_in_use(TileLoc::new(row, col)))
        .collect();
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn descriptors_can_be_retargeted() -> Result<()> {
    let (io, fake) = engine()?;
    let buf = memfd("payload", 0x1000)?;
    let mut mem = io.attach_memory(buf, 0x1000)?;
    let attached_fd = mem.fd().as_raw_fd();

    let mut bd = ShimDmaBd::with_virt_addr([0; SHIM_DMA_BD_WORDS], 0x1000);
    bd.set_buffer(&mem)?;
    io.program_shim_bd(&bd, TileLoc::new(0, 0), 1)?;
    assert!(fake.events().contains(&Event::ShimBd {
        loc: TileLoc::new(0, 0),
        bd_id: 1,
        target: BdTarget::DmaBuf(attached_fd),
        first_word: 0,
    }));

    bd.set_virt_addr(0xBEEF_0000);
    io.program_shim_bd(&bd, TileLoc::new(0, 0), 1)?;
    assert!(fake.events().contains(&Event::ShimBd {
        loc: TileLoc::new(0, 0),
        bd_id: 1,
        target: BdTarget::VirtAddr(0xBEEF_0000),
        first_word: 0,
    }));

    mem.detach()?;
    assert!(bd.set_buffer(&mem).is_err());
    Ok(())
}

#[test]
fn utilization_claim_failure_releases_partial_grants() -> Result<()> {
    let (io, fake) = engine()?;
    // Exhaust the counters of one core tile so the session's claim loop
    // fails partway through.
    fake.request_perf_counters(TileLoc::new(4, 1), PERF_COUNTERS_PER_TILE)?;
    assert!(io.start_utilization(Duration::from_millis(1)).is_err());
    assert_eq!(fake.outstanding_counters(), PERF_COUNTERS_PER_TILE);

    // And the slot is free again afterwards.
    for id in 0..PERF_COUNTERS_PER_TILE {
        fake.release_perf_counter(TileLoc::new(4, 1), id)?;
    }
    io.start_utilization(Duration::from_millis(1))?.wait()?;
    Ok(())
}

#[test]
fn descriptor_address_updates_go_through_a_dedicated_request() -> Result<()> {
    let (io, fake) = engine()?;
    let buf = memfd("payload", 0x1000)?;
    let mut mem = io.attach_memory(buf, 0x1000)?;
    let fd = mem.fd().as_raw_fd();

    mem.update_bd_addr(TileLoc::new(0, 1), 3, 0x200)?;
    assert!(fake.events().contains(&Event::ShimBdAddr {
        loc: TileLoc::new(0, 1),
        bd_id: 3,
        fd,
        offset: 0x200,
    }));

    // The offset must stay inside the buffer, and the slot must be a real
    // one on a shim tile.
    assert!(mem.update_bd_addr(TileLoc::new(0, 1), 3, 0x1000).is_err());
    assert!(mem.update_bd_addr(TileLoc::new(2, 0), 3, 0).is_err());
    assert!(mem.update_bd_addr(TileLoc::new(0, 0), 99, 0).is_err());

    mem.detach()?;
    assert!(mem.update_bd_addr(TileLoc::new(0, 1), 3, 0).is_err());
    Ok(())
}

#[test]
fn utilization_excludes_released_tiles() -> Result<()> {
    let (mut io, fake) = engine()?;
    io.initialize(None)?;
    io.release_tiles(&[TileLoc::new(2, 0)])?;

    // The device decides which tiles a session measures, so a released
    // tile drops out even though the engine's gating bookkeeping is only
    // refreshed on the next request or initialize.
    let report = io.start_utilization(Duration::from_millis(1))?.wait()?;
    assert_eq!(report.len(), 7);
    assert!(report.iter().all(|t| t.loc != TileLoc::new(2, 0)));
    assert_eq!(fake.outstanding_counters(), 0);
    Ok(())
}

#[test]
fn bound_descriptor_configs_program_later() -> Result<()> {
    let (io, fake) = engine()?;
    let mut words = [0u32; SHIM_DMA_BD_WORDS];
    words[0] = 0x800;
    let mut cfg = ShimDmaBd::with_virt_addr(words, 0x4000).bind(TileLoc::new(0, 1), 7)?;

    io.program_shim_bd_config(&cfg)?;
    assert!(fake.events().contains(&Event::ShimBd {
        loc: TileLoc::new(0, 1),
        bd_id: 7,
        target: BdTarget::VirtAddr(0x4000),
        first_word: 0x800,
    }));

    // Edits through the config land on the next programming of the same
    // slot.
    cfg.bd_mut().set_virt_addr(0x8000);
    io.program_shim_bd_config(&cfg)?;
    assert!(fake.events().contains(&Event::ShimBd {
        loc: TileLoc::new(0, 1),
        bd_id: 7,
        target: BdTarget::VirtAddr(0x8000),
        first_word: 0x800,
    }));
    Ok(())
}

#[test]
fn mask_poll_spends_at_most_its_read_budget() -> Result<()> {
    let (mut io, _fake) = engine()?;
    io.initialize(None)?;
    let off = offset(3, 1, 0x3_2004);
    io.write32(off, 0)?;

    // A zero budget reads once and returns without sleeping.
    let start = Instant::now();
    assert!(io.mask_poll(off, 0xFF, 0x1, 0).is_err());
    assert!(start.elapsed() < Duration::from_millis(50));

    // A 1ms budget sleeps ceil(1000/200) = 5 polling intervals and stops;
    // well short of what an unbounded retry loop would spend.
    let start = Instant::now();
    assert!(io.mask_poll(off, 0xFF, 0x1, 1000).is_err());
    let spent = start.elapsed();
    assert!(spent >= Duration::from_millis(1));
    assert!(spent < Duration::from_millis(500), "spent {spent:?}");
    Ok(())
}

#[test]
fn reads_straddling_a_window_base_are_rejected() -> Result<()> {
    init_tracing();
    // A profile whose core data window starts above zero, so a read can
    // begin in plain register space and end inside the window.
    let mut topology = ArrayTopology::aieml(2);
    topology.mems.data_mem_addr = 0x1002;
    let fake = Arc::new(FakePartition::new(&topology)?);
    let io = AieIo::with_backend(topology, Arc::clone(&fake) as Arc<dyn PartitionBackend>)?;

    let core = topology.tile_addr(TileLoc::new(2, 0));
    assert!(matches!(
        io.read32(core | 0x1000),
        Err(AieError::OutOfBounds { .. })
    ));
    // Ending at or before the window base is fine, as is a read wholly
    // inside the window.
    io.read32(core | 0xFFC)?;
    io.read32(core | 0x1004)?;
    Ok(())
}

#[test]
#[ignore = "requires array hardware at /dev/aie0"]
fn hardware_bring_up() -> Result<()> {
    init_tracing();
    let mut io = AieIo::open(ArrayTopology::aieml(4), IoConfig::default())?;
    io.initialize(None)?;
    io.teardown()?;
    Ok(())
}
