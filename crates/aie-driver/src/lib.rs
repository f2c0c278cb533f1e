//! Linux user-space backend for AI engine tile-array partitions.
//!
//! The kernel driver exposes the array through a character device: one fd
//! per partition, registers mapped read-only, tile memories mapped
//! read-write, and every privileged operation behind an ioctl. This crate
//! wraps that surface in an owned, bounds-checked API:
//!
//! - [`device`] — device node, partition enumeration and acquisition
//! - [`partition`] — the ioctl-speaking production backend
//! - [`backend`] — the [`backend::PartitionBackend`] seam the engine runs on
//! - [`mapping`] — bounds-checked `mmap` regions and tile memory discovery
//! - [`bitmap`] — clock-gating bookkeeping
//! - [`io`] — the partition I/O engine, [`io::AieIo`]
//! - [`mem`] — external memory and shim DMA descriptors
//! - [`perf`] — core utilization measurement
//! - [`txn`] — batched command submission
//!
//! ```no_run
//! use aie_chip::ArrayTopology;
//! use aie_driver::{AieIo, IoConfig};
//!
//! # fn main() -> aie_driver::Result<()> {
//! let mut io = AieIo::open(ArrayTopology::aieml(4), IoConfig::default())?;
//! io.initialize(None)?;
//! io.write32(0x0023_2000, 1)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod backend;
pub mod bitmap;
pub mod device;
pub mod error;
pub mod io;
pub mod mapping;
pub mod mem;
pub mod partition;
pub mod perf;
pub mod txn;
pub mod uapi;

pub use backend::{BdTarget, CycleCounts, MemoryDescriptor, PartitionBackend};
pub use device::{AieDevice, LivePartition, PartitionInfo};
pub use error::{AieError, Result};
pub use io::{AieIo, InitOptions, IoConfig};
pub use mem::{ExternalMemory, ShimDmaBd, ShimDmaBdConfig};
pub use partition::Partition;
pub use perf::{TileUtilization, UtilizationSession};
pub use txn::Transaction;
