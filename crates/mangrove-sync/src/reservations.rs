//! The reservations table: owns every download slot, stripes the initial
//! work across them and rebalances queues when one drains.

use std::sync::Arc;
use std::sync::Weak;

use bitcoin::BlockHash;
use log::debug;
use spin::Mutex;

use crate::reservation::Reservation;
use crate::SyncConfig;

/// Fleet-wide summary of the non-idle slots' normal rates.
///
/// With fewer than two active slots there is nothing to deviate from, and
/// the statistics are considered insufficient for expiration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateStatistics {
    /// Population mean of the normal rates.
    pub arithmetic_mean: f64,
    /// Population standard deviation of the normal rates.
    pub standard_deviation: f64,
    /// How many slots contributed.
    pub active_count: usize,
}

/// Owns one [`Reservation`] per configured parallel channel.
///
/// Slots are created here and live until the table is torn down; an empty
/// slot is a refill trigger, never a teardown. The table mutex serializes
/// partition orchestration against statistics snapshots, and is never held
/// across a store call.
#[derive(Debug)]
pub struct Reservations {
    slots: Vec<Arc<Reservation>>,
    mutex: Mutex<()>,
}

impl Reservations {
    /// Creates the table with `config.parallelism` empty slots, ids dense
    /// from zero.
    pub fn new(config: &SyncConfig) -> Arc<Reservations> {
        let parallelism = config.parallelism.max(1);

        Arc::new_cyclic(|table: &Weak<Reservations>| {
            let slots = (0..parallelism)
                .map(|slot| {
                    Arc::new(Reservation::new(
                        table.clone(),
                        slot,
                        config.block_latency_seconds,
                    ))
                })
                .collect();

            Reservations {
                slots,
                mutex: Mutex::new(()),
            }
        })
    }

    /// Stripes a batch of hashes from header sync across the slots.
    ///
    /// The batch is dealt in ascending height order, one height per slot in
    /// turn, so every queue comes out ascending and the slots cover
    /// interleaved heights of roughly equal weight.
    pub fn push_hashes(&self, mut hashes: Vec<(BlockHash, u32)>) {
        hashes.sort_unstable_by_key(|(_, height)| *height);

        for (index, (hash, height)) in hashes.into_iter().enumerate() {
            self.slots[index % self.slots.len()].insert(hash, height);
        }
    }

    /// Assigns a single late-arriving hash to the smallest queue.
    pub fn enqueue(&self, hash: BlockHash, height: u32) {
        if let Some(smallest) = self.slots.iter().min_by_key(|slot| slot.size()) {
            smallest.insert(hash, height);
        }
    }

    pub fn get(&self, slot: usize) -> Option<Arc<Reservation>> {
        self.slots.get(slot).cloned()
    }

    pub fn slots(&self) -> &[Arc<Reservation>] {
        &self.slots
    }

    /// How many slots the table drives, i.e. the configured parallelism.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Outstanding hashes across the whole table.
    pub fn size(&self) -> usize {
        self.slots.iter().map(|slot| slot.size()).sum()
    }

    /// A snapshot of the fleet statistics over the non-idle slots.
    pub fn rates(&self) -> RateStatistics {
        let _lock = self.mutex.lock();

        let rates: Vec<f64> = self
            .slots
            .iter()
            .map(|slot| slot.rate())
            .filter(|rate| !rate.idle)
            .map(|rate| rate.normal())
            .collect();

        let active_count = rates.len();

        if active_count == 0 {
            return RateStatistics::default();
        }

        let arithmetic_mean = rates.iter().sum::<f64>() / active_count as f64;
        let variance = rates
            .iter()
            .map(|rate| {
                let deviation = rate - arithmetic_mean;
                deviation * deviation
            })
            .sum::<f64>()
            / active_count as f64;

        RateStatistics {
            arithmetic_mean,
            standard_deviation: variance.sqrt(),
            active_count,
        }
    }

    /// Refills a drained slot by splitting the fleet's largest queue.
    ///
    /// A stopped slot is left alone, its channel is gone and its hashes (if
    /// any ever return) drain through other slots. When the largest queue is
    /// down to a single entry the download tail is reached, and the slot
    /// stays empty for the rest of the run.
    pub fn populate(&self, minimal: &Reservation) -> bool {
        if minimal.stopped() {
            return false;
        }

        let _lock = self.mutex.lock();

        let Some(maximal) = self
            .slots
            .iter()
            .filter(|slot| slot.slot() != minimal.slot())
            .max_by_key(|slot| slot.size())
        else {
            return false;
        };

        if maximal.size() < 2 {
            return false;
        }

        let populated = maximal.partition(minimal);

        if populated {
            debug!(
                "Populated slot ({}) from slot ({})",
                minimal.slot(),
                maximal.slot()
            );
        }

        populated
    }

    /// Ids of the slots currently expired against the fleet statistics.
    pub fn expired_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|slot| slot.expired())
            .map(|slot| slot.slot())
            .collect()
    }
}
