//! A per-channel download lane: the block hashes reserved to one peer, plus
//! the sliding-window record of how fast that peer clears them.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::Block;
use bitcoin::BlockHash;
use log::debug;
use log::info;
use mangrove_chain::UpdatableChain;
use spin::Mutex;
use spin::RwLock;

use crate::performance::Performance;
use crate::performance::PerformanceSample;
use crate::performance::MICRO_PER_SECOND;
use crate::performance::MINIMUM_HISTORY;
use crate::reservations::Reservations;

/// The allowed number of standard deviations below the norm.
///
/// With one channel the multiple is irrelevant, no channels are dropped.
/// With two channels a multiple under 1.0 drops a channel on every test,
/// while exactly 1.0 fluctuates on rounding deviations and anything above
/// 1.0 prevents all drops. With three or more channels the multiple sets
/// the allowed deviation from the norm.
const MULTIPLE: f64 = 1.01;

/// Both projections of the hash queue, plus the flags that travel with it.
///
/// Heights are unique within a run and hashes are unique, so the two maps
/// stay in lockstep. Iteration is by ascending height, so the peer is asked
/// for older blocks first.
#[derive(Debug, Default)]
struct HashQueue {
    by_height: BTreeMap<u32, BlockHash>,
    by_hash: HashMap<BlockHash, u32>,
    /// The current queue has not been fully emitted as a request since the
    /// last insertion or partition.
    pending: bool,
    /// The queue was split by a partition and the channel must restart
    /// before the remainder is re-requested.
    partitioned: bool,
}

impl HashQueue {
    fn insert(&mut self, hash: BlockHash, height: u32) {
        self.by_height.insert(height, hash);
        self.by_hash.insert(hash, height);
    }

    fn remove_hash(&mut self, hash: &BlockHash) -> Option<u32> {
        let height = self.by_hash.remove(hash)?;
        self.by_height.remove(&height);
        Some(height)
    }

    /// Removes and returns the oldest entry.
    fn pop_first(&mut self) -> Option<(u32, BlockHash)> {
        let (height, hash) = self.by_height.pop_first()?;
        self.by_hash.remove(&hash);
        Some((height, hash))
    }

    fn len(&self) -> usize {
        self.by_height.len()
    }

    fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }
}

/// One download slot, owned by the [`Reservations`] table and lent to a
/// single peer channel at a time.
///
/// The queue, the rate cache and the sample history are guarded by
/// independent locks, so a channel importing blocks never contends with the
/// supervisor reading statistics.
#[derive(Debug)]
pub struct Reservation {
    slot: usize,
    /// The sliding window throughput is averaged over, in microseconds.
    rate_window: u64,
    queue: RwLock<HashQueue>,
    rate: RwLock<Performance>,
    history: Mutex<VecDeque<PerformanceSample>>,
    stopped: AtomicBool,
    table: Weak<Reservations>,
}

impl Reservation {
    pub(crate) fn new(
        table: Weak<Reservations>,
        slot: usize,
        block_latency_seconds: u32,
    ) -> Reservation {
        Reservation {
            slot,
            rate_window: MINIMUM_HISTORY as u64 * block_latency_seconds as u64 * MICRO_PER_SECOND,
            queue: RwLock::new(HashQueue {
                pending: true,
                ..Default::default()
            }),
            rate: RwLock::new(Performance::IDLE),
            history: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            table,
        }
    }

    /// This slot's immutable identifier.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether outstanding hashes remain to be requested.
    pub fn pending(&self) -> bool {
        self.queue.read().pending
    }

    pub fn set_pending(&self, value: bool) {
        self.queue.write().pending = value;
    }

    /// Whether the performance record is in its reset state.
    pub fn idle(&self) -> bool {
        self.rate.read().idle
    }

    /// A copy of the current performance record.
    pub fn rate(&self) -> Performance {
        *self.rate.read()
    }

    pub(crate) fn set_rate(&self, rate: Performance) {
        *self.rate.write() = rate;
    }

    /// Sets the idle state and clears the history. Hashes are untouched.
    pub fn reset(&self) {
        self.set_rate(Performance::IDLE);
        self.history.lock().clear();
    }

    pub fn empty(&self) -> bool {
        self.queue.read().is_empty()
    }

    pub fn size(&self) -> usize {
        self.queue.read().len()
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Mirrors a channel stop. Performance is cleared but the hashes are
    /// kept, so the table can hand them to the next channel.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.reset();
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Builds the outstanding block request for this slot's channel.
    ///
    /// A new channel always gets the full queue and a fresh rate record. An
    /// existing channel only gets a packet while the queue is pending, so
    /// calling twice without an intervening insert or partition yields an
    /// empty packet. Hashes stay reserved: they leave the queue only when
    /// the matching block is imported.
    pub fn request(&self, new_channel: bool) -> Vec<Inventory> {
        // A new channel starts over, the next block opens its history.
        if new_channel {
            self.reset();
        }

        let mut queue = self.queue.write();

        if !new_channel && !queue.pending {
            return Vec::new();
        }

        let packet = queue
            .by_height
            .values()
            .map(|hash| Inventory::Block(*hash))
            .collect();

        queue.pending = false;
        packet
    }

    /// Adds a (hash, height) pair to the queue.
    pub fn insert(&self, hash: BlockHash, height: u32) {
        let mut queue = self.queue.write();

        queue.pending = true;
        queue.insert(hash, height);
    }

    /// Imports a block delivered by this slot's channel.
    ///
    /// A hash that is no longer in the queue was reassigned to another slot
    /// by a partition after the request went out, so the block is dropped
    /// without touching the performance record. On success the store cost is
    /// folded into the rate, and a drained queue asks the table for another
    /// slot's surplus.
    pub fn import(&self, chain: &impl UpdatableChain, block: &Block) {
        let hash = block.block_hash();

        let Some(height) = self.find_and_erase(&hash) else {
            debug!("Ignoring unsolicited block ({}) [{hash}]", self.slot);
            return;
        };

        let start = Instant::now();
        let success = chain.update(block, height);
        let cost = start.elapsed();

        if success {
            self.update_rate(1, cost);
            let record = self.rate();

            info!(
                "Imported block #{:06} ({:02}) [{}] {:06.2} {:05.2}%",
                height,
                self.slot,
                hash,
                record.total() * MICRO_PER_SECOND as f64,
                record.ratio() * 100.0
            );
        } else {
            debug!("Chain store rejected block #{height} ({}) [{hash}]", self.slot);
        }

        self.populate();
    }

    /// When the queue drains, asks the table to split another slot's queue
    /// into ours. A stopped slot stays empty, its channel is gone.
    fn populate(&self) {
        if self.stopped() || !self.empty() {
            return;
        }

        if let Some(table) = self.table.upgrade() {
            table.populate(self);
        }
    }

    /// Folds one import into the sliding window and republishes the rate.
    ///
    /// History entries older than the rate window are pruned from the head.
    /// Until a minimal history accumulates the record stays idle. May
    /// interleave with `reset`: a late update after idling shows up as a
    /// transient rate until the next reset, which only dilutes the average
    /// during channel startup.
    pub(crate) fn update_rate(&self, events: u64, cost: Duration) {
        let mut history = self.history.lock();

        let end = Instant::now();
        let event_start = end.checked_sub(cost).unwrap_or(end);
        let history_count = history.len();

        if let Some(window_start) = end.checked_sub(Duration::from_micros(self.rate_window)) {
            while history
                .front()
                .is_some_and(|sample| sample.time < window_start)
            {
                history.pop_front();
            }
        }

        // Entries fell off the head, so we cover at least a full window.
        let window_full = history_count > history.len();

        history.push_back(PerformanceSample {
            events,
            database: cost.as_micros() as u64,
            time: event_start,
        });

        // We can't set a rate until we have a period to average over.
        if history.len() < MINIMUM_HISTORY {
            return;
        }

        let mut rate = Performance {
            idle: false,
            events: 0,
            database: 0,
            window: 0,
        };

        for sample in history.iter() {
            rate.events = rate.events.saturating_add(sample.events);
            rate.database = rate.database.saturating_add(sample.database);
        }

        rate.window = if window_full {
            self.rate_window
        } else {
            history
                .front()
                .map_or(0, |first| end.duration_since(first.time).as_micros() as u64)
        };

        drop(history);

        self.set_rate(rate);
    }

    /// Whether this slot statistically underperforms the fleet.
    ///
    /// A slot expires when its normal rate falls below the fleet mean by
    /// more than [`MULTIPLE`] standard deviations. With fewer than two
    /// active slots the statistics are insufficient and nothing expires.
    pub fn expired(&self) -> bool {
        let Some(table) = self.table.upgrade() else {
            return false;
        };

        let statistics = table.rates();

        if statistics.active_count < 2 {
            return false;
        }

        let normal = self.rate().normal();
        let deviation = normal - statistics.arithmetic_mean;
        let allowed_deviation = MULTIPLE * statistics.standard_deviation;
        let outlier = deviation.abs() > allowed_deviation;
        let below_average = deviation < 0.0;
        let expired = below_average && outlier;

        debug!(
            "Statistics for slot ({}) adj:{:.6} avg:{:.6} dev:{:.6} sdv:{:.6} cnt:{} exp:{}",
            self.slot,
            normal * MICRO_PER_SECOND as f64,
            statistics.arithmetic_mean * MICRO_PER_SECOND as f64,
            deviation * MICRO_PER_SECOND as f64,
            statistics.standard_deviation * MICRO_PER_SECOND as f64,
            statistics.active_count,
            expired
        );

        expired
    }

    /// Clears a pending partition flag, marking the remainder pending again.
    ///
    /// Returns true when the caller must stop this slot's channel, so that a
    /// fresh channel picks the refilled queue up with a clean request.
    pub fn toggle_partitioned(&self) -> bool {
        let mut queue = self.queue.write();

        if queue.partitioned {
            queue.pending = true;
            queue.partitioned = false;
            return true;
        }

        false
    }

    /// Moves roughly half of this queue into `minimal`, which must be empty
    /// and quiescent. The table serializes all partitions under its mutex.
    ///
    /// Returns whether `minimal` received anything.
    pub(crate) fn partition(&self, minimal: &Reservation) -> bool {
        // The caller raced another refill, nothing to do.
        if !minimal.empty() {
            return true;
        }

        let mut source = self.queue.write();
        let mut destination = minimal.queue.write();

        // Take half, rounding up so a final single entry still moves.
        let offset = (source.len() + 1) / 2;

        for _ in 0..offset {
            let Some((height, hash)) = source.pop_first() else {
                break;
            };

            destination.insert(hash, height);
        }

        // The source keeps the larger half. Flagging it partitioned makes
        // the supervisor restart its channel, which re-requests the
        // remainder cleanly.
        let remaining = !source.is_empty();
        let populated = !destination.is_empty();
        source.partitioned = remaining;
        destination.pending = populated;

        let moved = destination.len();
        let left = source.len();

        drop(destination);
        drop(source);

        // The workload changed materially, the old rate no longer applies.
        if remaining {
            self.reset();
        }

        if populated {
            debug!(
                "Moved [{moved}] blocks from slot ({}) to ({}) leaving [{left}]",
                self.slot,
                minimal.slot()
            );
        }

        populated
    }

    fn find_and_erase(&self, hash: &BlockHash) -> Option<u32> {
        self.queue.write().remove_hash(hash)
    }
}
