//! # Hot-Swappable Thresholds
//!
//! The process-wide configuration is an immutable `ConfigSnapshot` behind an
//! `Arc`. Readers clone the `Arc` once at the start of a processing cycle and
//! keep using that snapshot; a reload builds a complete new snapshot and swaps
//! the pointer under the write lock, so a reader never sees a density
//! threshold from one generation paired with a radius from another.

use crate::model::QueueRef;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// The two numeric parameters consumed by the matcher and the alert evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigParameters {
    /// People-per-square-metre limit; reaching it raises a density alert.
    pub density_threshold: f64,
    /// Box half-width used only for positive-case broadcasts.
    pub positive_radius: u32,
}

impl Default for ConfigParameters {
    fn default() -> Self {
        Self { density_threshold: 2.5, positive_radius: 5 }
    }
}

/// Delays that pace the long-running loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationalDelays {
    /// Pause between two inbound receive calls.
    pub receive_delay: Duration,
    /// Pause between two configuration reloads.
    pub reload_delay: Duration,
}

impl Default for OperationalDelays {
    fn default() -> Self {
        Self {
            receive_delay: Duration::from_secs(1),
            reload_delay: Duration::from_secs(120),
        }
    }
}

/// Everything a reload replaces in one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigSnapshot {
    pub params: ConfigParameters,
    pub delays: OperationalDelays,
    /// Shared inbound queue; `None` until bootstrap has created it.
    pub inbound_queue: Option<QueueRef>,
}

/// Lock-protected holder of the current `ConfigSnapshot`.
#[derive(Debug)]
pub struct SharedThresholds {
    current: RwLock<Arc<ConfigSnapshot>>,
    generation: AtomicU64,
}

impl SharedThresholds {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            generation: AtomicU64::new(0),
        }
    }

    /// The snapshot every reader works from for the rest of its cycle.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Installs `next` atomically and returns the new generation number.
    pub fn replace(&self, next: ConfigSnapshot) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(next);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of successful swaps since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for SharedThresholds {
    fn default() -> Self {
        Self::new(ConfigSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_survives_replace() {
        let shared = SharedThresholds::default();
        let before = shared.snapshot();

        let mut next = ConfigSnapshot::default();
        next.params = ConfigParameters { density_threshold: 4.0, positive_radius: 9 };
        assert_eq!(shared.replace(next), 1);

        // The old reader keeps its consistent pair.
        assert_eq!(before.params, ConfigParameters::default());
        let after = shared.snapshot();
        assert_eq!(after.params.density_threshold, 4.0);
        assert_eq!(after.params.positive_radius, 9);
        assert_eq!(shared.generation(), 1);
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_pairs() {
        let shared = Arc::new(SharedThresholds::new(ConfigSnapshot {
            params: ConfigParameters { density_threshold: 1.0, positive_radius: 1 },
            ..Default::default()
        }));

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for i in 2..200u32 {
                    shared.replace(ConfigSnapshot {
                        params: ConfigParameters {
                            density_threshold: f64::from(i),
                            positive_radius: i,
                        },
                        ..Default::default()
                    });
                }
            })
        };

        for _ in 0..1000 {
            let snap = shared.snapshot();
            assert_eq!(snap.params.density_threshold, f64::from(snap.params.positive_radius));
        }
        writer.join().unwrap();
        assert_eq!(shared.generation(), 198);
    }
}
