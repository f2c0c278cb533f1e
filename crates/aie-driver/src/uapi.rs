//! Kernel ABI for the tile-array character device.
//!
//! Mirrors the driver's UAPI header: `#[repr(C)]` argument structs and the
//! `_IO`-family request numbers, built with the same bit layout the kernel
//! macros use. Pointers cross the boundary as `u64` so the layout is
//! identical on 32- and 64-bit userlands.

/// Device node exposing the array and its partitions.
pub const AIE_DEVICE_PATH: &str = "/dev/aie0";

/// Ioctl magic shared by device- and partition-level requests.
pub const AIE_IOCTL_BASE: u64 = b'A' as u64;

const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

const IOC_NONE: u64 = 0;
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << IOC_DIRSHIFT)
        | (AIE_IOCTL_BASE << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | (size << IOC_SIZESHIFT)
}

const fn io(nr: u64) -> u64 {
    ioc(IOC_NONE, nr, 0)
}

const fn iow<T>(nr: u64) -> u64 {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>() as u64)
}

const fn iowr<T>(nr: u64) -> u64 {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>() as u64)
}

/// Tile coordinate as the kernel orders it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AieLocation {
    /// Column index.
    pub col: u32,
    /// Row index.
    pub row: u32,
}

/// Rectangular tile span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AieRange {
    /// First tile of the span.
    pub start: AieLocation,
    /// Extent in tiles along each axis.
    pub size: AieLocation,
}

/// One partition as reported by enumeration.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePartitionDesc {
    /// Packed partition id.
    pub partition_id: u32,
    /// Creator uid of the partition.
    pub uid: u32,
    /// Column/row span of the partition.
    pub range: AieRange,
    /// Kernel-side status flags.
    pub status: u32,
}

/// Two-phase enumeration argument: count query, then descriptor fill.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePartitionQuery {
    /// Userspace pointer to `partition_cnt` descriptors, 0 to count only.
    pub partitions: u64,
    /// In/out descriptor count.
    pub partition_cnt: u32,
}

/// One entry of the partition fd list.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePartitionFd {
    /// Packed partition id.
    pub partition_id: u32,
    /// Fd on the live partition.
    pub fd: i32,
}

/// Two-phase fd-list argument: count query, then entry fill.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePartitionFdList {
    /// Userspace pointer to `num_entries` [`AiePartitionFd`]s, 0 to count
    /// only.
    pub entries: u64,
    /// In/out entry count.
    pub num_entries: u32,
}

/// Request ownership of a partition; the ioctl returns its fd.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePartitionReq {
    /// Packed partition id to claim.
    pub partition_id: u32,
    /// Expected creator uid, 0 to skip the check.
    pub uid: u32,
    /// Userspace pointer to opaque metadata, 0 for none.
    pub meta_data: u64,
    /// `AIE_PART_REQ_*` flags.
    pub flags: u32,
}

/// Register write through the partition fd.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieRegArgs {
    /// Operation selector, [`AIE_REG_WRITE`].
    pub op: u32,
    /// Read-modify-write mask, 0 for a plain store.
    pub mask: u32,
    /// Flat register offset within the partition.
    pub offset: u64,
    /// Value to store.
    pub val: u32,
}

/// Register operation: masked or plain 32-bit store.
pub const AIE_REG_WRITE: u32 = 1;

/// One host-mappable tile memory class.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieMem {
    /// Tiles the memory spans.
    pub range: AieRange,
    /// Intra-tile offset of the memory.
    pub offset: u64,
    /// Per-tile size in bytes.
    pub size: u64,
    /// Fd to mmap the concatenated region from.
    pub fd: i32,
}

/// Two-phase memory enumeration argument.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieMemArgs {
    /// Userspace pointer to `num_mems` entries, 0 to count only.
    pub mems: u64,
    /// In/out entry count.
    pub num_mems: u32,
}

/// Tile list argument shared by request/release.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieTilesArray {
    /// Userspace pointer to `num_tiles` [`AieLocation`]s.
    pub locs: u64,
    /// Number of entries at `locs`.
    pub num_tiles: u32,
}

/// Partition initialization argument.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePartitionInitArgs {
    /// Userspace pointer to the tiles to bring up, 0 for the whole span.
    pub locs: u64,
    /// Number of entries at `locs`.
    pub num_tiles: u32,
    /// `AIE_PART_INIT_OPT_*` bits.
    pub init_opts: u32,
}

/// Reset every column of the partition during init.
pub const AIE_PART_INIT_OPT_COLUMN_RST: u32 = 1 << 0;
/// Reset the shim row during init.
pub const AIE_PART_INIT_OPT_SHIM_RST: u32 = 1 << 1;
/// Zero all tile data memory during init.
pub const AIE_PART_INIT_OPT_ZEROIZE_MEM: u32 = 1 << 2;
/// Init behavior when the caller passes no options.
pub const AIE_PART_INIT_OPT_DEFAULT: u32 =
    AIE_PART_INIT_OPT_COLUMN_RST | AIE_PART_INIT_OPT_SHIM_RST | AIE_PART_INIT_OPT_ZEROIZE_MEM;

/// Column clock control argument.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieColumnArgs {
    /// First column to touch.
    pub start_col: u32,
    /// Number of columns.
    pub num_cols: u32,
    /// Nonzero enables the column clocks.
    pub enable: u8,
}

/// Shim DMA descriptor programmed against a virtual address.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieDmaBdArgs {
    /// Userspace pointer to [`SHIM_DMA_BD_WORDS`] descriptor words.
    pub bd: u64,
    /// Buffer virtual address the descriptor targets.
    pub data_va: u64,
    /// Shim tile owning the descriptor.
    pub loc: AieLocation,
    /// Hardware descriptor slot.
    pub bd_id: u32,
}

/// Shim DMA descriptor programmed against an attached dma-buf.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieDmabufBdArgs {
    /// Userspace pointer to [`SHIM_DMA_BD_WORDS`] descriptor words.
    pub bd: u64,
    /// Fd of a previously attached dma-buf.
    pub buf_fd: i32,
    /// Shim tile owning the descriptor.
    pub loc: AieLocation,
    /// Hardware descriptor slot.
    pub bd_id: u32,
}

/// Address rewrite for an already-programmed dma-buf descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieDmabufBdAddrArgs {
    /// Fd of the attached dma-buf the descriptor references.
    pub buf_fd: i32,
    /// New byte offset of the transfer within the dma-buf.
    pub offset: u64,
    /// Shim tile owning the descriptor.
    pub loc: AieLocation,
    /// Hardware descriptor slot.
    pub bd_id: u32,
}

/// Words in one shim DMA buffer descriptor.
pub const SHIM_DMA_BD_WORDS: usize = 8;

/// Batched command submission argument.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieTxnInst {
    /// Number of commands in the buffer.
    pub num_cmds: u32,
    /// Userspace pointer to the serialized command stream.
    pub cmds: u64,
}

/// One hardware resource grant.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieRsc {
    /// Tile the resource lives in.
    pub loc: AieLocation,
    /// Module within the tile.
    pub module: u32,
    /// Resource class, [`AIE_RSC_TYPE_PERF_COUNTER`].
    pub rsc_type: u32,
    /// Hardware resource id within the module.
    pub id: u32,
}

/// Resource request plus response buffer.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieRscReq {
    /// Tile to allocate from.
    pub loc: AieLocation,
    /// Module within the tile.
    pub module: u32,
    /// Resource class to allocate.
    pub rsc_type: u32,
    /// Number of resources wanted.
    pub num_rscs: u32,
    /// Allocation flags, currently 0.
    pub flags: u64,
}

/// Request wrapper carrying the grant output array.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieRscReqRsp {
    /// The allocation request.
    pub req: AieRscReq,
    /// Userspace pointer to `req.num_rscs` [`AieRsc`] grants.
    pub rscs: u64,
}

/// Performance counter resource class.
pub const AIE_RSC_TYPE_PERF_COUNTER: u32 = 2;
/// Core module selector for resource requests.
pub const AIE_MOD_CORE: u32 = 0;

/// Per-tile cycle counts reported by a utilization sample.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AieOccupancy {
    /// Tile the counts belong to.
    pub loc: AieLocation,
    /// Cycles the core spent executing during the window.
    pub active_cycles: u64,
    /// Cycles elapsed during the window.
    pub total_cycles: u64,
}

/// Utilization window argument shared by arm and sample.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct AiePerfUtilArgs {
    /// Userspace pointer to `num_tiles` [`AieOccupancy`] entries. Only the
    /// `loc` fields are read when arming; the counts are filled on sample.
    pub occupancy: u64,
    /// Number of entries at `occupancy`.
    pub num_tiles: u32,
    /// Measurement window in microseconds.
    pub window_us: u32,
}

/// Enumerate partitions on the device fd.
pub const AIE_ENQUIRE_PART_IOCTL: u64 = iowr::<AiePartitionQuery>(1);
/// Claim a partition; returns the partition fd.
pub const AIE_REQUEST_PART_IOCTL: u64 = iow::<AiePartitionReq>(2);
/// Initialize a partition's tiles.
pub const AIE_PARTITION_INIT_IOCTL: u64 = iow::<AiePartitionInitArgs>(3);
/// Tear a partition down.
pub const AIE_PARTITION_TEAR_IOCTL: u64 = io(4);
/// Drop software context without touching hardware state.
pub const AIE_PARTITION_CLR_CONTEXT_IOCTL: u64 = io(5);
/// Masked or plain register write.
pub const AIE_REG_IOCTL: u64 = iow::<AieRegArgs>(6);
/// Enumerate host-mappable tile memories.
pub const AIE_GET_MEM_IOCTL: u64 = iowr::<AieMemArgs>(7);
/// Attach a dma-buf fd to the partition.
pub const AIE_ATTACH_DMABUF_IOCTL: u64 = iow::<i32>(8);
/// Detach a previously attached dma-buf fd.
pub const AIE_DETACH_DMABUF_IOCTL: u64 = iow::<i32>(9);
/// Program a shim DMA descriptor from a virtual address.
pub const AIE_SET_SHIMDMA_BD_IOCTL: u64 = iow::<AieDmaBdArgs>(10);
/// Program a shim DMA descriptor from an attached dma-buf.
pub const AIE_SET_SHIMDMA_DMABUF_BD_IOCTL: u64 = iow::<AieDmabufBdArgs>(11);
/// Ungate a set of tiles.
pub const AIE_REQUEST_TILES_IOCTL: u64 = iow::<AieTilesArray>(12);
/// Gate a set of tiles.
pub const AIE_RELEASE_TILES_IOCTL: u64 = iow::<AieTilesArray>(13);
/// Enable or disable column clocks.
pub const AIE_SET_COLUMN_CLOCK_IOCTL: u64 = iow::<AieColumnArgs>(14);
/// Submit a serialized command batch.
pub const AIE_TRANSACTION_IOCTL: u64 = iow::<AieTxnInst>(15);
/// Allocate hardware resources.
pub const AIE_RSC_REQ_IOCTL: u64 = iowr::<AieRscReqRsp>(16);
/// Release one hardware resource.
pub const AIE_RSC_RELEASE_IOCTL: u64 = iow::<AieRsc>(17);
/// Arm a utilization measurement window.
pub const AIE_PERF_UTIL_ARM_IOCTL: u64 = iow::<AiePerfUtilArgs>(18);
/// Collect cycle counts from an armed window.
pub const AIE_PERF_UTIL_SAMPLE_IOCTL: u64 = iowr::<AiePerfUtilArgs>(19);
/// List fds of the partitions already live on the device.
pub const AIE_GET_PART_FD_LIST_IOCTL: u64 = iowr::<AiePartitionFdList>(20);
/// Rewrite only the address fields of a programmed dma-buf descriptor.
pub const AIE_UPDATE_SHIMDMA_DMABUF_BD_ADDR_IOCTL: u64 = iow::<AieDmabufBdAddrArgs>(21);
/// Enumerate enabled core tiles via a zero-window utilization query.
pub const AIE_PERF_UTIL_QUERY_IOCTL: u64 = iowr::<AiePerfUtilArgs>(22);
