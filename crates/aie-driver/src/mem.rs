//! External memory attachment and shim DMA buffer descriptors.
//!
//! Data moves between host memory and the array through shim-tile DMA. The
//! buffer either crosses the boundary as a process virtual address, pinned
//! by the kernel per transfer, or as a dma-buf attached to the partition up
//! front.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use aie_chip::TileLoc;
use tracing::{debug, warn};

use crate::backend::{BdTarget, PartitionBackend};
use crate::error::{AieError, Result};
use crate::uapi::SHIM_DMA_BD_WORDS;

/// Hardware descriptor slots per shim DMA engine.
pub const SHIM_DMA_NUM_BDS: u32 = 16;

fn check_shim_slot(loc: TileLoc, bd_id: u32) -> Result<()> {
    if loc.row != 0 {
        return Err(AieError::invalid_argument(format!(
            "tile {loc} is not a shim tile"
        )));
    }
    if bd_id >= SHIM_DMA_NUM_BDS {
        return Err(AieError::invalid_argument(format!(
            "descriptor slot {bd_id} out of range"
        )));
    }
    Ok(())
}

/// A dma-buf attached to a partition for descriptor use.
///
/// Detaches on drop if the caller has not done so already.
#[derive(Debug)]
pub struct ExternalMemory {
    backend: Arc<dyn PartitionBackend>,
    fd: OwnedFd,
    size: u64,
    attached: bool,
}

impl ExternalMemory {
    /// Attach `fd` to the partition.
    pub fn attach(backend: Arc<dyn PartitionBackend>, fd: OwnedFd, size: u64) -> Result<Self> {
        backend.attach_dma_buffer(fd.as_fd())?;
        debug!(fd = fd.as_raw_fd(), size, "dma-buf attached");
        Ok(Self {
            backend,
            fd,
            size,
            attached: true,
        })
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The attached fd.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Whether the buffer is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Detach from the partition, invalidating descriptors built on this
    /// buffer.
    pub fn detach(&mut self) -> Result<()> {
        if !self.attached {
            return Err(AieError::invalid_argument("buffer is not attached"));
        }
        self.backend.detach_dma_buffer(self.fd.as_fd())?;
        self.attached = false;
        Ok(())
    }

    /// Point an already-programmed descriptor at a new offset inside this
    /// buffer, leaving the rest of the descriptor untouched.
    pub fn update_bd_addr(&self, loc: TileLoc, bd_id: u32, offset: u64) -> Result<()> {
        if !self.attached {
            return Err(AieError::invalid_argument(
                "descriptor update references a detached buffer",
            ));
        }
        check_shim_slot(loc, bd_id)?;
        if offset >= self.size {
            return Err(AieError::invalid_argument(format!(
                "offset {offset:#x} is past the end of a {:#x}-byte buffer",
                self.size
            )));
        }
        self.backend
            .update_shim_dma_bd_addr(loc, bd_id, self.fd.as_raw_fd(), offset)
    }

    /// Hand the buffer to the CPU domain before reading results.
    pub fn sync_for_cpu(&self) -> Result<()> {
        self.backend.sync_for_cpu(self.fd.as_fd())
    }

    /// Hand the buffer to the device domain before a transfer.
    pub fn sync_for_device(&self) -> Result<()> {
        self.backend.sync_for_device(self.fd.as_fd())
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.backend.detach_dma_buffer(self.fd.as_fd()) {
                warn!("detach of dma-buf {} failed: {e}", self.fd.as_raw_fd());
            }
        }
    }
}

/// Data source/sink of a shim DMA descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimBdAddr {
    /// Process virtual address.
    VirtAddr(u64),
    /// Offset-less reference to an attached dma-buf.
    Buffer(RawFd),
}

/// One shim DMA buffer descriptor, held by value so callers can reuse or
/// drop their own word buffers after building it.
#[derive(Debug, Clone, Copy)]
pub struct ShimDmaBd {
    words: [u32; SHIM_DMA_BD_WORDS],
    addr: ShimBdAddr,
}

impl ShimDmaBd {
    /// Descriptor over a plain virtual address.
    pub fn with_virt_addr(words: [u32; SHIM_DMA_BD_WORDS], va: u64) -> Self {
        Self {
            words,
            addr: ShimBdAddr::VirtAddr(va),
        }
    }

    /// Descriptor over an attached buffer.
    pub fn with_buffer(words: [u32; SHIM_DMA_BD_WORDS], mem: &ExternalMemory) -> Result<Self> {
        if !mem.is_attached() {
            return Err(AieError::invalid_argument(
                "descriptor references a detached buffer",
            ));
        }
        Ok(Self {
            words,
            addr: ShimBdAddr::Buffer(mem.fd().as_raw_fd()),
        })
    }

    /// Descriptor words as programmed.
    pub fn words(&self) -> &[u32; SHIM_DMA_BD_WORDS] {
        &self.words
    }

    /// Retarget the descriptor at a new virtual address.
    pub fn set_virt_addr(&mut self, va: u64) {
        self.addr = ShimBdAddr::VirtAddr(va);
    }

    /// Retarget the descriptor at an attached buffer.
    pub fn set_buffer(&mut self, mem: &ExternalMemory) -> Result<()> {
        if !mem.is_attached() {
            return Err(AieError::invalid_argument(
                "descriptor references a detached buffer",
            ));
        }
        self.addr = ShimBdAddr::Buffer(mem.fd().as_raw_fd());
        Ok(())
    }

    /// Replace one descriptor word, for length/address updates between
    /// submissions.
    pub fn set_word(&mut self, index: usize, value: u32) -> Result<()> {
        if index >= SHIM_DMA_BD_WORDS {
            return Err(AieError::invalid_argument(format!(
                "descriptor word index {index} out of range"
            )));
        }
        self.words[index] = value;
        Ok(())
    }

    /// Program the descriptor into slot `bd_id` of a shim tile's DMA engine.
    pub fn program(
        &self,
        backend: &dyn PartitionBackend,
        loc: TileLoc,
        bd_id: u32,
    ) -> Result<()> {
        check_shim_slot(loc, bd_id)?;
        backend.set_shim_dma_bd(loc, bd_id, &self.words, self.target())
    }

    /// Pin the descriptor to a slot, producing a self-contained config that
    /// can be programmed later without re-supplying the coordinates.
    pub fn bind(&self, loc: TileLoc, bd_id: u32) -> Result<ShimDmaBdConfig> {
        check_shim_slot(loc, bd_id)?;
        Ok(ShimDmaBdConfig { loc, bd_id, bd: *self })
    }

    fn target(&self) -> BdTarget {
        match self.addr {
            ShimBdAddr::VirtAddr(va) => BdTarget::VirtAddr(va),
            ShimBdAddr::Buffer(fd) => BdTarget::DmaBuf(fd),
        }
    }
}

/// A [`ShimDmaBd`] bound to its shim tile and descriptor slot.
///
/// Useful when the descriptor is built in one place and programmed in
/// another, or reprogrammed repeatedly into the same slot.
#[derive(Debug, Clone, Copy)]
pub struct ShimDmaBdConfig {
    loc: TileLoc,
    bd_id: u32,
    bd: ShimDmaBd,
}

impl ShimDmaBdConfig {
    /// The shim tile the config targets.
    pub fn loc(&self) -> TileLoc {
        self.loc
    }

    /// The descriptor slot the config targets.
    pub fn bd_id(&self) -> u32 {
        self.bd_id
    }

    /// The descriptor itself, for word or address edits before programming.
    pub fn bd_mut(&mut self) -> &mut ShimDmaBd {
        &mut self.bd
    }

    /// Descriptor words as they would be programmed.
    pub fn words(&self) -> &[u32; SHIM_DMA_BD_WORDS] {
        self.bd.words()
    }

    /// Program the descriptor into its bound slot.
    pub fn program(&self, backend: &dyn PartitionBackend) -> Result<()> {
        self.bd.program(backend, self.loc, self.bd_id)
    }
}
