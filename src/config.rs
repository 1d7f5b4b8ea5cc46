//! Tuning knobs that are not architecture facts (SPEC_FULL.md §A.3).
//!
//! A `ClusterDescriptor` is the one piece of configuration this crate
//! consumes as a typed value handed in by a collaborator; everything in this
//! module is timeouts, retry counts, and debug switches, with defaults
//! sourced from the architecture constants and overridable by the embedding
//! application. Nothing here is read from a file.

use std::time::Duration;

/// Tuning constants shared by the ARC messenger, the per-chip I/O engine,
/// and the lock manager.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Overall deadline for one ARC mailbox/queue message round trip.
    pub arc_message_timeout: Duration,
    /// Deadline for `wait_eth_core_training` before logging a warning and
    /// returning (flaky-board behavior, spec §5/§7).
    pub eth_training_timeout: Duration,
    /// Deadline for `wait_dram_channel_training`.
    pub dram_training_timeout: Duration,
    /// Deadline for a single DMA transfer's completion poll (spec §4.F: 10 s
    /// in the reference implementation).
    pub dma_timeout: Duration,
    /// Deadline for `wait_arc_core_start`.
    pub arc_core_start_timeout: Duration,
    /// Deadline for `wait_for_aiclk_value`.
    pub aiclk_wait_timeout: Duration,
    /// Poll interval used by every busy-wait loop in this crate.
    pub poll_interval: Duration,
    /// Number of times a caller-visible retry wrapper (none of which this
    /// crate invokes internally, per spec §7's "the messenger does not
    /// internally retry") suggests retrying a transient ARC failure.
    pub arc_message_retries: u32,
    /// Directory named mutexes (§4.K) are backed by on Linux. Irrelevant to
    /// `SimulationBackend`-only callers.
    pub lock_directory: std::path::PathBuf,
    /// Enables the generation-A post-configure read-checking assertion
    /// (SPEC_FULL.md §B.6).
    pub debug_mode: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            arc_message_timeout: Duration::from_secs(1),
            eth_training_timeout: Duration::from_secs(15),
            dram_training_timeout: Duration::from_secs(5),
            dma_timeout: Duration::from_secs(10),
            arc_core_start_timeout: Duration::from_secs(5),
            aiclk_wait_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            arc_message_retries: 3,
            lock_directory: std::path::PathBuf::from("/var/lock/tt-umd-core"),
            debug_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = DriverConfig::default();
        assert!(cfg.dma_timeout >= cfg.arc_message_timeout);
        assert!(!cfg.debug_mode);
    }
}
