//! The array device node: partition enumeration and acquisition.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use rustix::fs::{open, Mode, OFlags};
use tracing::{debug, info};

use crate::error::{AieError, Result};
use crate::partition::Partition;
use crate::uapi::{
    AiePartitionDesc, AiePartitionFd, AiePartitionFdList, AiePartitionQuery, AiePartitionReq,
    AIE_DEVICE_PATH, AIE_ENQUIRE_PART_IOCTL, AIE_GET_PART_FD_LIST_IOCTL, AIE_REQUEST_PART_IOCTL,
};

/// A partition the device reports as available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Packed partition id, see [`aie_chip::partition_id`].
    pub partition_id: u32,
    /// Creator uid.
    pub uid: u32,
    /// First column of the partition.
    pub start_col: u32,
    /// Column count of the partition.
    pub num_cols: u32,
}

/// A live partition's fd as reported by the fd-list command.
#[derive(Debug)]
pub struct LivePartition {
    /// Packed partition id.
    pub partition_id: u32,
    /// Owned fd on the partition, ready to adopt.
    pub fd: OwnedFd,
}

/// Handle on the array character device.
#[derive(Debug)]
pub struct AieDevice {
    fd: OwnedFd,
}

impl AieDevice {
    /// Open the default device node.
    pub fn open() -> Result<Self> {
        Self::open_path(AIE_DEVICE_PATH)
    }

    /// Open a specific device node.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AieError::DeviceNotFound {
                path: path.display().to_string(),
            });
        }
        let fd = open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| AieError::device_io("open device", e.into()))?;
        info!(path = %path.display(), "opened array device");
        Ok(Self { fd })
    }

    fn ioctl<T>(&self, op: &'static str, req: u64, arg: *mut T) -> Result<libc::c_int> {
        // SAFETY: arg points to a live repr(C) value matching the request's
        // declared payload.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), req as libc::c_ulong, arg) };
        if rc < 0 {
            return Err(AieError::device(op));
        }
        Ok(rc)
    }

    /// Enumerate partitions: one counting pass, one fill pass.
    pub fn partitions(&self) -> Result<Vec<PartitionInfo>> {
        let mut query = AiePartitionQuery::default();
        self.ioctl("count partitions", AIE_ENQUIRE_PART_IOCTL, &mut query)?;
        if query.partition_cnt == 0 {
            return Ok(Vec::new());
        }
        let mut descs = vec![AiePartitionDesc::default(); query.partition_cnt as usize];
        query.partitions = descs.as_mut_ptr() as u64;
        self.ioctl("enumerate partitions", AIE_ENQUIRE_PART_IOCTL, &mut query)?;
        descs.truncate(query.partition_cnt as usize);
        debug!(count = descs.len(), "partitions enumerated");
        Ok(descs
            .into_iter()
            .map(|d| PartitionInfo {
                partition_id: d.partition_id,
                uid: d.uid,
                start_col: d.range.start.col,
                num_cols: d.range.size.col,
            })
            .collect())
    }

    /// Fds of the partitions already live on the device, for adoption by
    /// [`crate::io::IoConfig::partition`].
    pub fn partition_fds(&self) -> Result<Vec<LivePartition>> {
        let mut list = AiePartitionFdList::default();
        self.ioctl("count partition fds", AIE_GET_PART_FD_LIST_IOCTL, &mut list)?;
        if list.num_entries == 0 {
            return Ok(Vec::new());
        }
        let mut entries = vec![AiePartitionFd::default(); list.num_entries as usize];
        list.entries = entries.as_mut_ptr() as u64;
        self.ioctl("fetch partition fds", AIE_GET_PART_FD_LIST_IOCTL, &mut list)?;
        entries.truncate(list.num_entries as usize);
        entries
            .into_iter()
            .map(|e| {
                if e.fd < 0 {
                    return Err(AieError::invalid_backend(format!(
                        "partition {:#x} listed without an fd",
                        e.partition_id
                    )));
                }
                Ok(LivePartition {
                    partition_id: e.partition_id,
                    // SAFETY: the kernel returned a fresh fd we now own.
                    fd: unsafe { OwnedFd::from_raw_fd(e.fd) },
                })
            })
            .collect()
    }

    /// Claim a partition by id, returning its fd wrapped as a backend.
    pub fn request_partition(&self, partition_id: u32, flags: u32) -> Result<Partition> {
        let mut req = AiePartitionReq {
            partition_id,
            flags,
            ..AiePartitionReq::default()
        };
        let fd = self.ioctl("request partition", AIE_REQUEST_PART_IOCTL, &mut req)?;
        info!(partition_id = format_args!("{partition_id:#x}"), fd, "partition acquired");
        // SAFETY: a successful request returns a fresh fd we now own.
        Ok(Partition::from_fd(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
}
