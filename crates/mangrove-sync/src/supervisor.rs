//! The periodic babysitter for the reservation table.
//!
//! Channels import blocks on their own tasks; this task owns the two slow
//! control-plane decisions: restarting the channel of a slot whose queue was
//! split by a partition, and evicting channels that statistically
//! underperform the fleet. The supervisor never touches sockets itself, it
//! reports [`SlotEvent`]s to the hosting node, which owns connection
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use log::warn;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

use crate::error::SyncError;
use crate::reservations::Reservations;
use crate::SyncConfig;

/// Run a task and log any errors that might occur.
macro_rules! try_and_log {
    ($what:expr) => {
        let result = $what;

        if let Err(error) = result {
            log::error!("{}:{} - {:?}", line!(), file!(), error);
        }
    };
}

/// What the hosting node should do about a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    /// The slot's queue changed under its channel (a partition took or gave
    /// work). Stop the channel and start a fresh one, whose first request
    /// re-emits the queue cleanly.
    Restart(usize),
    /// The slot's channel was stopped for underperforming the fleet. Its
    /// remaining hashes drain to other slots through the table.
    Evicted(usize),
}

#[derive(Debug)]
pub struct Supervisor {
    table: Arc<Reservations>,
    events: UnboundedSender<SlotEvent>,
    kill_signal: Arc<RwLock<bool>>,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(
        table: Arc<Reservations>,
        events: UnboundedSender<SlotEvent>,
        kill_signal: Arc<RwLock<bool>>,
        config: &SyncConfig,
    ) -> Supervisor {
        Supervisor {
            table,
            events,
            kill_signal,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Runs until the kill signal is set, sweeping the table every poll
    /// interval.
    pub async fn run(self) {
        info!("Starting reservation supervisor");

        loop {
            tokio::time::sleep(self.poll_interval).await;

            if *self.kill_signal.read().await {
                break;
            }

            try_and_log!(self.check_slots());
        }

        info!("Reservation supervisor stopped");
    }

    /// One pass over the table: restart partitioned slots, evict laggards.
    fn check_slots(&self) -> Result<(), SyncError> {
        for slot in self.table.slots() {
            if slot.toggle_partitioned() {
                self.events.send(SlotEvent::Restart(slot.slot()))?;
                continue;
            }

            if !slot.idle() && slot.expired() {
                warn!(
                    "Slot ({}) is underperforming the fleet, stopping its channel",
                    slot.slot()
                );

                slot.stop();
                self.events.send(SlotEvent::Evicted(slot.slot()))?;
            }
        }

        Ok(())
    }
}
