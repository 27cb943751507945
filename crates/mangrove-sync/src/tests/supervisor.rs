//! The supervisor's control-plane decisions, driven end to end over the
//! event channel.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::p2p::message_blockdata::Inventory;
use mangrove_chain::MemoryChain;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::performance::Performance;
use crate::tests::utils::build_run;
use crate::Reservations;
use crate::SlotEvent;
use crate::Supervisor;
use crate::SyncConfig;

fn config(parallelism: usize) -> SyncConfig {
    SyncConfig {
        parallelism,
        block_latency_seconds: 5,
        poll_interval_secs: 1,
    }
}

#[tokio::test]
async fn supervisor_restarts_a_partitioned_slot() {
    let config = config(2);
    let table = Reservations::new(&config);
    let run = build_run(0..6);
    table.push_hashes(run.hashes.clone());

    // Drain slot 1 so the refill partitions slot 0 and flags it.
    let chain = MemoryChain::new();
    let drained = table.get(1).unwrap();
    for inventory in drained.request(true) {
        let Inventory::Block(hash) = inventory else {
            unreachable!()
        };

        drained.import(&chain, &run.blocks[&hash]);
    }

    let (sender, mut receiver) = unbounded_channel();
    let kill_signal = Arc::new(RwLock::new(false));
    let supervisor = Supervisor::new(table.clone(), sender, kill_signal.clone(), &config);
    let handle = tokio::spawn(supervisor.run());

    let event = timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, SlotEvent::Restart(0));

    // The flag is one-shot: a restarted channel re-requests the remainder.
    assert!(table.get(0).unwrap().pending());

    *kill_signal.write().await = true;
    handle.await.unwrap();
}

#[tokio::test]
async fn supervisor_evicts_a_statistical_laggard() {
    let config = config(3);
    let table = Reservations::new(&config);

    table.get(0).unwrap().set_rate(Performance {
        idle: false,
        events: 1000,
        database: 0,
        window: 1,
    });
    table.get(1).unwrap().set_rate(Performance {
        idle: false,
        events: 1000,
        database: 0,
        window: 1,
    });
    table.get(2).unwrap().set_rate(Performance {
        idle: false,
        events: 10,
        database: 0,
        window: 1,
    });

    let (sender, mut receiver) = unbounded_channel();
    let kill_signal = Arc::new(RwLock::new(false));
    let supervisor = Supervisor::new(table.clone(), sender, kill_signal.clone(), &config);
    let handle = tokio::spawn(supervisor.run());

    let event = timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, SlotEvent::Evicted(2));

    let evicted = table.get(2).unwrap();
    assert!(evicted.stopped());
    assert!(evicted.idle());
    assert!(!table.get(0).unwrap().stopped());
    assert!(!table.get(1).unwrap().stopped());

    *kill_signal.write().await = true;
    handle.await.unwrap();
}
