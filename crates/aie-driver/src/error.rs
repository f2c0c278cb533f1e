//! Driver error type.

use std::io;

/// Alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AieError>;

/// Everything that can go wrong while driving a tile-array partition.
#[derive(Debug, thiserror::Error)]
pub enum AieError {
    /// The device node is absent.
    #[error("device not found: {path}")]
    DeviceNotFound {
        /// Path that was probed.
        path: String,
    },

    /// A syscall against the device or partition failed.
    #[error("device operation `{op}` failed: {source}")]
    Device {
        /// Operation being performed.
        op: &'static str,
        /// Underlying OS error.
        source: io::Error,
    },

    /// Register access to a tile whose clocks are gated off.
    #[error("tile ({row},{col}) is clock gated")]
    TileGated {
        /// Tile row.
        row: u32,
        /// Tile column.
        col: u32,
    },

    /// Access falls outside the mapped region or partition address space.
    #[error("access at offset {offset:#x} len {len} exceeds limit {limit:#x}")]
    OutOfBounds {
        /// Starting byte offset of the access.
        offset: u64,
        /// Length of the access in bytes.
        len: u64,
        /// Exclusive upper bound that was violated.
        limit: u64,
    },

    /// Caller-supplied arguments are inconsistent.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// How the arguments were inconsistent.
        reason: String,
    },

    /// The backend does not implement this operation.
    #[error("operation not supported: {op}")]
    NotSupported {
        /// Operation that was requested.
        op: &'static str,
    },

    /// The backend produced state the driver cannot consume.
    #[error("invalid backend state: {reason}")]
    InvalidBackend {
        /// What was wrong with the backend state.
        reason: String,
    },

    /// A bounded register poll expired without the value converging.
    #[error("poll of register {offset:#x} timed out after {timeout_us}us")]
    Timeout {
        /// Register offset being polled.
        offset: u64,
        /// Timeout budget that elapsed.
        timeout_us: u32,
    },

    /// A kernel memory descriptor matched no known tile memory class.
    #[error("memory descriptor offset {offset:#x} size {size:#x} matches no tile memory")]
    UnclassifiedMemory {
        /// Intra-tile offset reported by the kernel.
        offset: u64,
        /// Per-tile size reported by the kernel.
        size: u64,
    },
}

impl AieError {
    /// Wrap the current `errno` as a failed device operation.
    pub fn device(op: &'static str) -> Self {
        Self::Device {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap an explicit OS error as a failed device operation.
    pub fn device_io(op: &'static str, source: io::Error) -> Self {
        Self::Device { op, source }
    }

    /// Build an [`AieError::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Build an [`AieError::InvalidBackend`].
    pub fn invalid_backend(reason: impl Into<String>) -> Self {
        Self::InvalidBackend {
            reason: reason.into(),
        }
    }
}
