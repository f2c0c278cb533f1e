//! Memory-mapped regions and tile memory discovery.
//!
//! Every mapping the kernel hands out (the read-only register space and the
//! read-write tile memories) is wrapped in [`MappedRegion`], which carries
//! its length and refuses accesses past it. Raw pointer arithmetic happens
//! only behind those checks.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::{self, NonNull};

use aie_chip::{ArrayTopology, TileLoc, TileType};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use tracing::debug;

use crate::backend::{MemoryDescriptor, PartitionBackend};
use crate::error::{AieError, Result};

/// Bulk copies run on chunks aligned to this many bytes; the unaligned head
/// and tail go word-at-a-time.
pub const BULK_ALIGN: usize = 16;
const BULK_WORDS: usize = BULK_ALIGN / 4;

/// Page protection a region was mapped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Mapped `PROT_READ`.
    ReadOnly,
    /// Mapped `PROT_READ | PROT_WRITE`.
    ReadWrite,
}

/// A live `mmap` of device-backed memory with bounds-checked word access.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    access: Access,
    // Keeps a kernel-provided fd alive for the mapping's lifetime.
    _fd: Option<OwnedFd>,
}

// The mapping is shared device memory; concurrent access is governed by the
// callers, not by &mut.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `fd` at offset 0.
    pub fn map(fd: BorrowedFd<'_>, len: usize, access: Access) -> Result<Self> {
        let prot = match access {
            Access::ReadOnly => ProtFlags::READ,
            Access::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
        };
        // SAFETY: null hint, length validated by the kernel, fd stays open
        // at least as long as the call.
        let raw = unsafe { mmap(ptr::null_mut(), len, prot, MapFlags::SHARED, fd, 0) }
            .map_err(|e| AieError::device_io("mmap", e.into()))?;
        debug!(len, ?access, "mapped region at {raw:p}");
        Ok(Self {
            ptr: NonNull::new(raw.cast()).ok_or_else(|| {
                AieError::invalid_backend("mmap returned a null mapping")
            })?,
            len,
            access,
            _fd: None,
        })
    }

    /// Map `len` bytes of `fd`, taking ownership of the fd for the mapping's
    /// lifetime.
    pub fn map_owned(fd: OwnedFd, len: usize, access: Access) -> Result<Self> {
        let mut region = Self::map(fd.as_fd(), len, access)?;
        region._fd = Some(fd);
        Ok(region)
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset % 4 != 0 {
            return Err(AieError::invalid_argument(format!(
                "unaligned register access at {offset:#x}"
            )));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(AieError::OutOfBounds {
                offset: offset as u64,
                len: len as u64,
                limit: self.len as u64,
            }),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.access != Access::ReadWrite {
            return Err(AieError::NotSupported {
                op: "write to read-only mapping",
            });
        }
        Ok(())
    }

    /// Volatile 32-bit load at a byte offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        // SAFETY: bounds and alignment checked above; mapping lives as long
        // as &self.
        Ok(unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() })
    }

    /// Volatile 32-bit store at a byte offset.
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset, 4)?;
        self.check_writable()?;
        // SAFETY: bounds, alignment, and protection checked above.
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }

    /// Store a word slice at a byte offset, bulk-copying the 16-byte-aligned
    /// middle of the destination.
    pub fn write_words(&self, offset: usize, words: &[u32]) -> Result<()> {
        self.check(offset, words.len() * 4)?;
        self.check_writable()?;
        // SAFETY: destination span checked above; src is a live slice.
        unsafe {
            copy_words(
                self.ptr.as_ptr().add(offset).cast::<u32>(),
                words.as_ptr(),
                words.len(),
            );
        }
        Ok(())
    }

    /// Store `count` copies of `value` starting at a byte offset.
    pub fn fill_words(&self, offset: usize, value: u32, count: usize) -> Result<()> {
        self.check(offset, count * 4)?;
        self.check_writable()?;
        // SAFETY: destination span checked above.
        unsafe {
            fill_words(self.ptr.as_ptr().add(offset).cast::<u32>(), value, count);
        }
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            debug!("munmap failed: {e}");
        }
    }
}

/// Copy `count` words to a device destination: word stores until `dst` is
/// 16-byte aligned, one bulk copy over the aligned middle, word stores for
/// the tail.
///
/// # Safety
/// `dst` must be valid for `count` word writes and `src` for `count` word
/// reads; the ranges must not overlap.
unsafe fn copy_words(mut dst: *mut u32, mut src: *const u32, mut count: usize) {
    while count > 0 && (dst as usize) % BULK_ALIGN != 0 {
        dst.write_volatile(src.read());
        dst = dst.add(1);
        src = src.add(1);
        count -= 1;
    }
    let bulk = count - count % BULK_WORDS;
    if bulk > 0 {
        ptr::copy_nonoverlapping(src, dst, bulk);
        dst = dst.add(bulk);
        src = src.add(bulk);
        count -= bulk;
    }
    while count > 0 {
        dst.write_volatile(src.read());
        dst = dst.add(1);
        src = src.add(1);
        count -= 1;
    }
}

/// Word-fill counterpart of [`copy_words`].
///
/// # Safety
/// `dst` must be valid for `count` word writes.
unsafe fn fill_words(mut dst: *mut u32, value: u32, mut count: usize) {
    while count > 0 && (dst as usize) % BULK_ALIGN != 0 {
        dst.write_volatile(value);
        dst = dst.add(1);
        count -= 1;
    }
    if count >= BULK_WORDS {
        let bulk = count - count % BULK_WORDS;
        let chunk = vec![value; bulk];
        ptr::copy_nonoverlapping(chunk.as_ptr(), dst, bulk);
        dst = dst.add(bulk);
        count -= bulk;
    }
    while count > 0 {
        dst.write_volatile(value);
        dst = dst.add(1);
        count -= 1;
    }
}

/// Host-mappable tile memory classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    /// Core program memory, exposed at a host-visible alias offset.
    Prog,
    /// Core data memory.
    Data,
    /// Memory-tile memory.
    MemTile,
}

/// Match a kernel memory descriptor against the device memory profile.
pub fn classify(topology: &ArrayTopology, offset: u64, size: u64) -> Result<MemKind> {
    let mems = &topology.mems;
    if offset == mems.prog_mem_host_offset && size == mems.prog_mem_size {
        return Ok(MemKind::Prog);
    }
    if offset == mems.data_mem_addr && size == mems.data_mem_size {
        return Ok(MemKind::Data);
    }
    if topology.has_mem_tiles()
        && offset == mems.mem_tile_mem_addr
        && size == mems.mem_tile_mem_size
    {
        return Ok(MemKind::MemTile);
    }
    Err(AieError::UnclassifiedMemory { offset, size })
}

#[derive(Debug)]
struct TileMemory {
    region: MappedRegion,
    /// Intra-tile base address of this memory class.
    base: u64,
    /// Per-tile size in bytes.
    unit: u64,
}

/// All mapped tile memories of a partition, ready for window resolution.
#[derive(Debug, Default)]
pub struct TileMemories {
    prog: Option<TileMemory>,
    data: Option<TileMemory>,
    mem_tile: Option<TileMemory>,
}

impl TileMemories {
    /// Enumerate the partition's memories through `backend`, classify each,
    /// and map it read-write.
    ///
    /// A descriptor matching no memory class is a hard error; a class the
    /// kernel does not report is simply left unmapped and block accesses to
    /// it fall back to register writes.
    pub fn discover(backend: &dyn PartitionBackend, topology: &ArrayTopology) -> Result<Self> {
        let mut mems = Self::default();
        for desc in backend.memory_descriptors()? {
            let kind = classify(topology, desc.offset, desc.size)?;
            mems.insert(kind, topology, desc)?;
        }
        Ok(mems)
    }

    fn insert(
        &mut self,
        kind: MemKind,
        topology: &ArrayTopology,
        desc: MemoryDescriptor,
    ) -> Result<()> {
        let tiles = u64::from(desc.rows) * u64::from(desc.cols);
        let map_len = desc
            .size
            .checked_mul(tiles)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| AieError::invalid_backend("tile memory size overflows"))?;
        debug!(?kind, size = desc.size, rows = desc.rows, cols = desc.cols, "mapping tile memory");
        let mem = TileMemory {
            region: MappedRegion::map_owned(desc.fd, map_len, Access::ReadWrite)?,
            base: match kind {
                MemKind::Prog => topology.mems.prog_mem_host_offset,
                MemKind::Data => topology.mems.data_mem_addr,
                MemKind::MemTile => topology.mems.mem_tile_mem_addr,
            },
            unit: desc.size,
        };
        let slot = match kind {
            MemKind::Prog => &mut self.prog,
            MemKind::Data => &mut self.data,
            MemKind::MemTile => &mut self.mem_tile,
        };
        if slot.is_some() {
            return Err(AieError::invalid_backend(format!(
                "duplicate {kind:?} memory descriptor"
            )));
        }
        *slot = Some(mem);
        Ok(())
    }

    /// Resolve a tile-local address span to a mapped window.
    ///
    /// Returns the containing region and the byte offset within it, or
    /// `None` when the span lies in no mapped memory (the caller then goes
    /// register by register).
    pub fn window(
        &self,
        topology: &ArrayTopology,
        tile_type: TileType,
        loc: TileLoc,
        local_addr: u64,
        len: u64,
    ) -> Option<(&MappedRegion, usize)> {
        let candidates: &[&Option<TileMemory>] = match tile_type {
            TileType::Core => &[&self.prog, &self.data],
            TileType::MemTile => &[&self.mem_tile],
            TileType::Shim => &[],
        };
        for mem in candidates.iter().filter_map(|m| m.as_ref()) {
            let end = local_addr.checked_add(len)?;
            if local_addr >= mem.base && end <= mem.base + mem.unit {
                let off = topology.mem_region_offset(tile_type, loc, mem.unit)
                    + (local_addr - mem.base);
                return usize::try_from(off).ok().map(|off| (&mem.region, off));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::{ftruncate, memfd_create, MemfdFlags};

    fn anon_region(len: usize, access: Access) -> MappedRegion {
        let fd = memfd_create("region-test", MemfdFlags::CLOEXEC).unwrap();
        ftruncate(&fd, len as u64).unwrap();
        MappedRegion::map_owned(fd, len, access).unwrap()
    }

    #[test]
    fn reads_and_writes_round_trip() {
        let region = anon_region(4096, Access::ReadWrite);
        region.write_u32(0x40, 0xDEAD_BEEF).unwrap();
        assert_eq!(region.read_u32(0x40).unwrap(), 0xDEAD_BEEF);
        assert_eq!(region.read_u32(0x44).unwrap(), 0);
    }

    #[test]
    fn out_of_bounds_and_unaligned_accesses_fail() {
        let region = anon_region(4096, Access::ReadWrite);
        assert!(matches!(
            region.read_u32(4096),
            Err(AieError::OutOfBounds { .. })
        ));
        assert!(matches!(
            region.write_u32(4094, 0),
            Err(AieError::OutOfBounds { .. })
        ));
        assert!(matches!(
            region.read_u32(2),
            Err(AieError::InvalidArgument { .. })
        ));
        assert!(matches!(
            region.write_words(4092, &[0, 0]),
            Err(AieError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn read_only_mappings_refuse_writes() {
        let region = anon_region(4096, Access::ReadOnly);
        assert!(region.read_u32(0).is_ok());
        assert!(matches!(
            region.write_u32(0, 1),
            Err(AieError::NotSupported { .. })
        ));
    }

    #[test]
    fn word_copies_survive_every_alignment() {
        // Exercise head/bulk/tail splits across destination alignments and
        // lengths, with sentinels guarding both ends.
        for word_off in 0..8usize {
            for len in [0usize, 1, 2, 3, 4, 5, 7, 8, 15, 16, 17, 63, 300] {
                let region = anon_region(8192, Access::ReadWrite);
                let src: Vec<u32> = (0..len as u32).map(|i| i.wrapping_mul(0x0101_0101)).collect();
                let base = 0x100 + word_off * 4;
                region.write_u32(base - 4, 0xA5A5_A5A5).unwrap();
                region.write_u32(base + len * 4, 0x5A5A_5A5A).unwrap();
                region.write_words(base, &src).unwrap();
                for (i, want) in src.iter().enumerate() {
                    assert_eq!(region.read_u32(base + i * 4).unwrap(), *want);
                }
                assert_eq!(region.read_u32(base - 4).unwrap(), 0xA5A5_A5A5);
                assert_eq!(region.read_u32(base + len * 4).unwrap(), 0x5A5A_5A5A);
            }
        }
    }

    #[test]
    fn word_fills_survive_every_alignment() {
        for word_off in 0..8usize {
            for len in [0usize, 1, 3, 4, 16, 33] {
                let region = anon_region(4096, Access::ReadWrite);
                let base = 0x200 + word_off * 4;
                region.write_u32(base + len * 4, 0x5A5A_5A5A).unwrap();
                region.fill_words(base, 0xCAFE_F00D, len).unwrap();
                for i in 0..len {
                    assert_eq!(region.read_u32(base + i * 4).unwrap(), 0xCAFE_F00D);
                }
                assert_eq!(region.read_u32(base + len * 4).unwrap(), 0x5A5A_5A5A);
            }
        }
    }

    #[test]
    fn classification_matches_the_memory_profile() {
        let topo = ArrayTopology::aieml(4);
        assert_eq!(classify(&topo, 0x2_0000, 0x4000).unwrap(), MemKind::Prog);
        assert_eq!(classify(&topo, 0, 0x1_0000).unwrap(), MemKind::Data);
        assert_eq!(classify(&topo, 0, 0x8_0000).unwrap(), MemKind::MemTile);
        assert!(matches!(
            classify(&topo, 0x1234, 0x10),
            Err(AieError::UnclassifiedMemory { .. })
        ));
        // Without a memory-tile band the mem-tile size matches nothing.
        let topo = ArrayTopology::aie(4);
        assert!(classify(&topo, 0, 0x8_0000).is_err());
    }
}
