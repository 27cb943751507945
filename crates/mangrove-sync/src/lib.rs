// SPDX-License-Identifier: MIT

//! Parallel block-download reservation scheduler.
//!
//! During initial block download we drive many peer channels at once. Each
//! channel owns a [`Reservation`]: a private, non-overlapping queue of block
//! hashes it is responsible for, paired with a sliding-window record of how
//! fast its peer clears them. The [`Reservations`] table stripes the initial
//! work across slots, computes fleet-wide statistics on demand and splits the
//! largest queue into whichever slot drains first, so the download tail is
//! absorbed by the fastest peers instead of being paced by the slowest one.
//! A [`Supervisor`] task periodically restarts partitioned channels and
//! evicts statistical laggards.
//!
//! Any given block hash belongs to exactly one slot at any time: hashes move
//! between slots only through a partition, and leave the table only when the
//! chain store accepts the block.

pub mod error;
pub mod performance;
pub mod reservation;
pub mod reservations;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use error::SyncError;
pub use performance::Performance;
pub use reservation::Reservation;
pub use reservations::RateStatistics;
pub use reservations::Reservations;
pub use supervisor::SlotEvent;
pub use supervisor::Supervisor;

/// Configuration for the block download scheduler.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many peer channels download in parallel. Defaults to 8.
    ///
    /// Each channel gets its own reservation slot. More slots mean more
    /// parallelism, but also more partitioning near the download tail.
    pub parallelism: usize,
    /// Expected seconds for a peer to deliver one block. Defaults to 60.
    ///
    /// Together with the minimal history this sets the sliding window that
    /// throughput is averaged over: a slot must accumulate a full window of
    /// imports before it leaves the idle state and counts toward the fleet
    /// statistics.
    pub block_latency_seconds: u32,
    /// Seconds between supervisor passes over the table. Defaults to 5.
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            parallelism: 8,
            block_latency_seconds: 60,
            poll_interval_secs: 5,
        }
    }
}
