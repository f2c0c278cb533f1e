//! Batched command submission.
//!
//! A transaction is an opaque serialized command stream generated by the
//! code path that would otherwise issue the register operations one by one;
//! the kernel replays it in a single crossing.

use crate::backend::PartitionBackend;
use crate::error::{AieError, Result};

/// A serialized command batch ready for submission.
#[derive(Debug, Clone)]
pub struct Transaction {
    num_cmds: u32,
    buf: Vec<u8>,
}

impl Transaction {
    /// Wrap an already-serialized command stream.
    pub fn new(num_cmds: u32, buf: Vec<u8>) -> Result<Self> {
        if num_cmds == 0 || buf.is_empty() {
            return Err(AieError::invalid_argument("empty transaction"));
        }
        Ok(Self { num_cmds, buf })
    }

    /// Wrap a word-granular command stream.
    pub fn from_words(num_cmds: u32, words: &[u32]) -> Result<Self> {
        Self::new(num_cmds, bytemuck::cast_slice(words).to_vec())
    }

    /// Commands in the batch.
    pub fn num_cmds(&self) -> u32 {
        self.num_cmds
    }

    /// Serialized bytes of the batch.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Submit the batch through `backend`.
    pub fn submit(&self, backend: &dyn PartitionBackend) -> Result<()> {
        backend.submit_transaction(self.num_cmds, &self.buf)
    }
}
