//! Core utilization measurement over hardware performance counters.
//!
//! One session at a time: it claims two performance counters in every
//! enabled core tile (active cycles and total cycles), measures a window on
//! a worker thread, and reports percentages. The session object owns the
//! counters end to end; they are released before the result is delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aie_chip::TileLoc;
use tracing::{debug, warn};

use crate::backend::PartitionBackend;
use crate::error::{AieError, Result};

/// Counters claimed per core tile: active cycles and total cycles.
const COUNTERS_PER_TILE: u32 = 2;

/// Utilization of one core tile over a measurement window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileUtilization {
    /// The core tile measured.
    pub loc: TileLoc,
    /// Active cycles as a percentage of the window, 0 to 100.
    pub percent: u8,
}

fn percent(active: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = active.saturating_mul(100) / total;
    u8::try_from(pct.min(100)).unwrap_or(100)
}

struct ClaimedTile {
    loc: TileLoc,
    counters: Vec<u32>,
}

fn release_all(backend: &dyn PartitionBackend, claimed: &[ClaimedTile]) {
    for tile in claimed {
        for &id in &tile.counters {
            if let Err(e) = backend.release_perf_counter(tile.loc, id) {
                warn!("release of perf counter {id} in tile {} failed: {e}", tile.loc);
            }
        }
    }
}

/// A running utilization measurement.
///
/// Obtained from [`crate::io::AieIo::start_utilization`]; call
/// [`UtilizationSession::wait`] for the result.
#[derive(Debug)]
pub struct UtilizationSession {
    rx: mpsc::Receiver<Result<Vec<TileUtilization>>>,
    worker: Option<thread::JoinHandle<()>>,
    active: Arc<AtomicBool>,
}

impl UtilizationSession {
    /// Claim counters in the given core tiles and start measuring `window`
    /// on a worker thread.
    ///
    /// Fails if another session is outstanding or any counter cannot be
    /// claimed; counters claimed before the failure are released again.
    pub(crate) fn start(
        backend: Arc<dyn PartitionBackend>,
        tiles: &[TileLoc],
        window: Duration,
        active: Arc<AtomicBool>,
    ) -> Result<Self> {
        if active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AieError::invalid_argument(
                "a utilization session is already running",
            ));
        }
        let claimed = match claim_counters(backend.as_ref(), tiles) {
            Ok(claimed) => claimed,
            Err(e) => {
                active.store(false, Ordering::Release);
                return Err(e);
            }
        };
        debug!(tiles = claimed.len(), ?window, "utilization session started");

        let claimed = Arc::new(claimed);
        let (tx, rx) = mpsc::channel();
        let worker_active = Arc::clone(&active);
        let worker_backend = Arc::clone(&backend);
        let worker_claimed = Arc::clone(&claimed);
        let spawned = thread::Builder::new()
            .name("aie-util".into())
            .spawn(move || {
                let result = measure(worker_backend.as_ref(), &worker_claimed, window);
                release_all(worker_backend.as_ref(), &worker_claimed);
                worker_active.store(false, Ordering::Release);
                // The receiver may have been dropped; nothing to do then.
                let _ = tx.send(result);
            });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                release_all(backend.as_ref(), &claimed);
                active.store(false, Ordering::Release);
                return Err(AieError::device_io("spawn utilization worker", e));
            }
        };

        Ok(Self {
            rx,
            worker: Some(worker),
            active,
        })
    }

    /// Block until the window completes and return per-tile utilization.
    pub fn wait(mut self) -> Result<Vec<TileUtilization>> {
        let result = self
            .rx
            .recv()
            .map_err(|_| AieError::invalid_backend("utilization worker exited early"))?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        result
    }

    /// Whether the measurement window is still open.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for UtilizationSession {
    fn drop(&mut self) {
        // An abandoned session still finishes its window and releases its
        // counters; wait for that here so the flag is consistent after drop.
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn claim_counters(backend: &dyn PartitionBackend, tiles: &[TileLoc]) -> Result<Vec<ClaimedTile>> {
    let mut claimed = Vec::with_capacity(tiles.len());
    for &loc in tiles {
        match backend.request_perf_counters(loc, COUNTERS_PER_TILE) {
            Ok(counters) => claimed.push(ClaimedTile { loc, counters }),
            Err(e) => {
                release_all(backend, &claimed);
                return Err(e);
            }
        }
    }
    Ok(claimed)
}

fn measure(
    backend: &dyn PartitionBackend,
    claimed: &[ClaimedTile],
    window: Duration,
) -> Result<Vec<TileUtilization>> {
    let tiles: Vec<TileLoc> = claimed.iter().map(|t| t.loc).collect();
    let counts = backend.capture_utilization(&tiles, window)?;
    if counts.len() != tiles.len() {
        return Err(AieError::invalid_backend(format!(
            "utilization capture returned {} counts for {} tiles",
            counts.len(),
            tiles.len()
        )));
    }
    Ok(tiles
        .into_iter()
        .zip(counts)
        .map(|(loc, c)| TileUtilization {
            loc,
            percent: percent(c.active_cycles, c.total_cycles),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_clamped_and_zero_safe() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(200, 200), 100);
        // Counter skew can report more active than total cycles.
        assert_eq!(percent(300, 200), 100);
        assert_eq!(percent(u64::MAX, u64::MAX), 100);
    }
}
