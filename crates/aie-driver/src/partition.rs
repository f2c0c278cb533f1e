//! Production [`PartitionBackend`] speaking the partition fd's ioctl set.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use aie_chip::TileLoc;
use tracing::{debug, trace};

use crate::backend::{BdTarget, CycleCounts, MemoryDescriptor, PartitionBackend};
use crate::error::{AieError, Result};
use crate::mapping::{Access, MappedRegion};
use crate::uapi::{
    AieDmaBdArgs, AieDmabufBdAddrArgs, AieDmabufBdArgs, AieLocation, AieMem, AieMemArgs,
    AieOccupancy, AiePartitionInitArgs, AiePerfUtilArgs, AieRegArgs, AieRsc, AieRscReqRsp,
    AieTilesArray, AieTxnInst, AieColumnArgs, AIE_ATTACH_DMABUF_IOCTL, AIE_DETACH_DMABUF_IOCTL,
    AIE_GET_MEM_IOCTL, AIE_MOD_CORE, AIE_PARTITION_CLR_CONTEXT_IOCTL, AIE_PARTITION_INIT_IOCTL,
    AIE_PARTITION_TEAR_IOCTL, AIE_PERF_UTIL_ARM_IOCTL, AIE_PERF_UTIL_QUERY_IOCTL,
    AIE_PERF_UTIL_SAMPLE_IOCTL, AIE_REG_IOCTL, AIE_REG_WRITE, AIE_RELEASE_TILES_IOCTL,
    AIE_REQUEST_TILES_IOCTL, AIE_RSC_RELEASE_IOCTL, AIE_RSC_REQ_IOCTL,
    AIE_RSC_TYPE_PERF_COUNTER, AIE_SET_COLUMN_CLOCK_IOCTL, AIE_SET_SHIMDMA_BD_IOCTL,
    AIE_SET_SHIMDMA_DMABUF_BD_IOCTL, AIE_TRANSACTION_IOCTL,
    AIE_UPDATE_SHIMDMA_DMABUF_BD_ADDR_IOCTL, SHIM_DMA_BD_WORDS,
};

// Grace added on top of a utilization window before sampling, so the kernel
// has closed the window by the time we collect.
const UTIL_WINDOW_SLACK: Duration = Duration::from_millis(1);

/// An owned partition fd obtained from the device (or adopted from another
/// process over an fd-passing channel).
#[derive(Debug)]
pub struct Partition {
    fd: OwnedFd,
}

impl Partition {
    /// Wrap an already-open partition fd.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// The raw fd, for callers that need to hand it elsewhere.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn ioctl<T>(&self, op: &'static str, req: u64, arg: *mut T) -> Result<libc::c_int> {
        trace!(op, req = format_args!("{req:#x}"), "partition ioctl");
        // SAFETY: arg points to a live repr(C) value matching the request's
        // declared payload.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), req as libc::c_ulong, arg) };
        if rc < 0 {
            return Err(AieError::device(op));
        }
        Ok(rc)
    }

    fn ioctl_val(&self, op: &'static str, req: u64, arg: libc::c_ulong) -> Result<libc::c_int> {
        // SAFETY: the request takes its argument by value.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), req as libc::c_ulong, arg) };
        if rc < 0 {
            return Err(AieError::device(op));
        }
        Ok(rc)
    }

    fn ioctl_plain(&self, op: &'static str, req: u64) -> Result<()> {
        self.ioctl(op, req, std::ptr::null_mut::<libc::c_void>())
            .map(|_| ())
    }
}

fn to_locations(locs: &[TileLoc]) -> Vec<AieLocation> {
    locs.iter()
        .map(|l| AieLocation {
            col: l.col,
            row: l.row,
        })
        .collect()
}

impl PartitionBackend for Partition {
    fn map_registers(&self, len: usize) -> Result<MappedRegion> {
        MappedRegion::map(self.fd.as_fd(), len, Access::ReadOnly)
    }

    fn memory_descriptors(&self) -> Result<Vec<MemoryDescriptor>> {
        let mut args = AieMemArgs::default();
        self.ioctl("enumerate memories", AIE_GET_MEM_IOCTL, &mut args)?;
        if args.num_mems == 0 {
            return Ok(Vec::new());
        }
        let mut mems = vec![AieMem::default(); args.num_mems as usize];
        args.mems = mems.as_mut_ptr() as u64;
        self.ioctl("fetch memories", AIE_GET_MEM_IOCTL, &mut args)?;
        mems.truncate(args.num_mems as usize);
        mems.into_iter()
            .map(|m| {
                if m.fd < 0 {
                    return Err(AieError::invalid_backend(format!(
                        "memory at offset {:#x} carries no fd",
                        m.offset
                    )));
                }
                Ok(MemoryDescriptor {
                    offset: m.offset,
                    size: m.size,
                    rows: m.range.size.row,
                    cols: m.range.size.col,
                    // SAFETY: the kernel returned a fresh fd we now own.
                    fd: unsafe { OwnedFd::from_raw_fd(m.fd) },
                })
            })
            .collect()
    }

    fn reg_write(&self, offset: u64, mask: u32, value: u32) -> Result<()> {
        let mut args = AieRegArgs {
            op: AIE_REG_WRITE,
            mask,
            offset,
            val: value,
        };
        self.ioctl("register write", AIE_REG_IOCTL, &mut args)?;
        Ok(())
    }

    fn request_tiles(&self, locs: &[TileLoc]) -> Result<()> {
        let locs = to_locations(locs);
        let mut args = AieTilesArray {
            locs: locs.as_ptr() as u64,
            num_tiles: locs.len() as u32,
        };
        self.ioctl("request tiles", AIE_REQUEST_TILES_IOCTL, &mut args)?;
        Ok(())
    }

    fn release_tiles(&self, locs: &[TileLoc]) -> Result<()> {
        let locs = to_locations(locs);
        let mut args = AieTilesArray {
            locs: locs.as_ptr() as u64,
            num_tiles: locs.len() as u32,
        };
        self.ioctl("release tiles", AIE_RELEASE_TILES_IOCTL, &mut args)?;
        Ok(())
    }

    fn init_partition(&self, opts: u32, locs: &[TileLoc]) -> Result<()> {
        debug!(opts = format_args!("{opts:#x}"), tiles = locs.len(), "partition init");
        let locs = to_locations(locs);
        let mut args = AiePartitionInitArgs {
            locs: if locs.is_empty() {
                0
            } else {
                locs.as_ptr() as u64
            },
            num_tiles: locs.len() as u32,
            init_opts: opts,
        };
        self.ioctl("partition init", AIE_PARTITION_INIT_IOCTL, &mut args)?;
        Ok(())
    }

    fn teardown_partition(&self) -> Result<()> {
        self.ioctl_plain("partition teardown", AIE_PARTITION_TEAR_IOCTL)
    }

    fn clear_context(&self) -> Result<()> {
        self.ioctl_plain("clear context", AIE_PARTITION_CLR_CONTEXT_IOCTL)
    }

    fn set_column_clock(&self, start_col: u32, num_cols: u32, enable: bool) -> Result<()> {
        let mut args = AieColumnArgs {
            start_col,
            num_cols,
            enable: u8::from(enable),
        };
        self.ioctl("column clock", AIE_SET_COLUMN_CLOCK_IOCTL, &mut args)?;
        Ok(())
    }

    fn attach_dma_buffer(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.ioctl_val(
            "attach dma-buf",
            AIE_ATTACH_DMABUF_IOCTL,
            fd.as_raw_fd() as libc::c_ulong,
        )?;
        Ok(())
    }

    fn detach_dma_buffer(&self, fd: BorrowedFd<'_>) -> Result<()> {
        self.ioctl_val(
            "detach dma-buf",
            AIE_DETACH_DMABUF_IOCTL,
            fd.as_raw_fd() as libc::c_ulong,
        )?;
        Ok(())
    }

    fn set_shim_dma_bd(
        &self,
        loc: TileLoc,
        bd_id: u32,
        words: &[u32; SHIM_DMA_BD_WORDS],
        target: BdTarget,
    ) -> Result<()> {
        let loc = AieLocation {
            col: loc.col,
            row: loc.row,
        };
        match target {
            BdTarget::VirtAddr(va) => {
                let mut args = AieDmaBdArgs {
                    bd: words.as_ptr() as u64,
                    data_va: va,
                    loc,
                    bd_id,
                };
                self.ioctl("set shim dma bd", AIE_SET_SHIMDMA_BD_IOCTL, &mut args)?;
            }
            BdTarget::DmaBuf(buf_fd) => {
                let mut args = AieDmabufBdArgs {
                    bd: words.as_ptr() as u64,
                    buf_fd,
                    loc,
                    bd_id,
                };
                self.ioctl(
                    "set shim dma-buf bd",
                    AIE_SET_SHIMDMA_DMABUF_BD_IOCTL,
                    &mut args,
                )?;
            }
        }
        Ok(())
    }

    fn update_shim_dma_bd_addr(
        &self,
        loc: TileLoc,
        bd_id: u32,
        buf_fd: RawFd,
        offset: u64,
    ) -> Result<()> {
        let mut args = AieDmabufBdAddrArgs {
            buf_fd,
            offset,
            loc: AieLocation {
                col: loc.col,
                row: loc.row,
            },
            bd_id,
        };
        self.ioctl(
            "update shim dma-buf bd address",
            AIE_UPDATE_SHIMDMA_DMABUF_BD_ADDR_IOCTL,
            &mut args,
        )?;
        Ok(())
    }

    fn submit_transaction(&self, num_cmds: u32, cmds: &[u8]) -> Result<()> {
        let mut args = AieTxnInst {
            num_cmds,
            cmds: cmds.as_ptr() as u64,
        };
        self.ioctl("submit transaction", AIE_TRANSACTION_IOCTL, &mut args)?;
        Ok(())
    }

    fn request_perf_counters(&self, loc: TileLoc, count: u32) -> Result<Vec<u32>> {
        let mut rscs = vec![AieRsc::default(); count as usize];
        let mut args = AieRscReqRsp::default();
        args.req.loc = AieLocation {
            col: loc.col,
            row: loc.row,
        };
        args.req.module = AIE_MOD_CORE;
        args.req.rsc_type = AIE_RSC_TYPE_PERF_COUNTER;
        args.req.num_rscs = count;
        args.rscs = rscs.as_mut_ptr() as u64;
        self.ioctl("request perf counters", AIE_RSC_REQ_IOCTL, &mut args)?;
        Ok(rscs.into_iter().map(|r| r.id).collect())
    }

    fn release_perf_counter(&self, loc: TileLoc, id: u32) -> Result<()> {
        let mut rsc = AieRsc {
            loc: AieLocation {
                col: loc.col,
                row: loc.row,
            },
            module: AIE_MOD_CORE,
            rsc_type: AIE_RSC_TYPE_PERF_COUNTER,
            id,
        };
        self.ioctl("release perf counter", AIE_RSC_RELEASE_IOCTL, &mut rsc)?;
        Ok(())
    }

    fn enabled_core_tiles(&self) -> Result<Vec<TileLoc>> {
        // Zero-window query: first call reports the count, second fills the
        // tile list without arming any measurement.
        let mut args = AiePerfUtilArgs::default();
        self.ioctl("count enabled tiles", AIE_PERF_UTIL_QUERY_IOCTL, &mut args)?;
        if args.num_tiles == 0 {
            return Ok(Vec::new());
        }
        let mut occupancy = vec![AieOccupancy::default(); args.num_tiles as usize];
        args.occupancy = occupancy.as_mut_ptr() as u64;
        self.ioctl("list enabled tiles", AIE_PERF_UTIL_QUERY_IOCTL, &mut args)?;
        occupancy.truncate(args.num_tiles as usize);
        Ok(occupancy
            .into_iter()
            .map(|o| TileLoc::new(o.loc.row, o.loc.col))
            .collect())
    }

    fn capture_utilization(&self, tiles: &[TileLoc], window: Duration) -> Result<Vec<CycleCounts>> {
        let mut occupancy: Vec<AieOccupancy> = tiles
            .iter()
            .map(|l| AieOccupancy {
                loc: AieLocation {
                    col: l.col,
                    row: l.row,
                },
                ..AieOccupancy::default()
            })
            .collect();
        let window_us = u32::try_from(window.as_micros())
            .map_err(|_| AieError::invalid_argument("utilization window exceeds u32 microseconds"))?;
        let mut args = AiePerfUtilArgs {
            occupancy: occupancy.as_mut_ptr() as u64,
            num_tiles: occupancy.len() as u32,
            window_us,
        };
        self.ioctl("arm utilization window", AIE_PERF_UTIL_ARM_IOCTL, &mut args)?;
        std::thread::sleep(window + UTIL_WINDOW_SLACK);
        self.ioctl(
            "sample utilization",
            AIE_PERF_UTIL_SAMPLE_IOCTL,
            &mut args,
        )?;
        Ok(occupancy
            .into_iter()
            .map(|o| CycleCounts {
                active_cycles: o.active_cycles,
                total_cycles: o.total_cycles,
            })
            .collect())
    }
}
