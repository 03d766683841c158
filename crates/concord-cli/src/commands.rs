//! Demo runs of the mutex and queue against an in-process store

use std::sync::Arc;
use std::time::Duration;

use concord_concurrency::{CancellationToken, Mutex, Queue, Session, SessionConfig};
use concord_store::{KvClient, MemoryStore};
use tracing::{info, warn};

use crate::config::{LockConfig, QueueConfig};

/// How often the store sweeps expired leases
const LEASE_REAP_PERIOD: Duration = Duration::from_millis(500);

fn new_store() -> Arc<dyn KvClient> {
    Arc::new(MemoryStore::new().with_lease_reaper(LEASE_REAP_PERIOD))
}

/// Start `contenders` sessions on one mutex, one after another, and report the
/// order in which they acquire it.
pub async fn run_lock(
    session_config: SessionConfig,
    lock: LockConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let client = new_store();
    let hold = Duration::from_millis(lock.hold_ms);

    let mut tasks = Vec::with_capacity(lock.contenders);
    for id in 0..lock.contenders {
        let session = Session::open_with_config(client.clone(), session_config.clone()).await?;
        let prefix = lock.prefix.clone();
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            let mut mutex = Mutex::new(&session, &prefix);
            let result = hold_lock(id, &mut mutex, hold, &cancel).await;
            if let Err(e) = session.close().await {
                warn!("Contender {} failed to close its session: {}", id, e);
            }
            result
        }));

        // give each contender a distinct arrival so the order is observable
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for task in tasks {
        task.await??;
    }
    Ok(())
}

async fn hold_lock(
    id: usize,
    mutex: &mut Mutex,
    hold: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    info!("Contender {} requesting the lock", id);
    mutex.lock(cancel).await?;

    let acquired_at = mutex.header().map(|h| h.revision).unwrap_or_default();
    println!(
        "contender {} acquired key={} revision={} at store revision {}",
        id,
        mutex.key(),
        mutex.revision(),
        acquired_at
    );

    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = cancel.cancelled() => {}
    }

    // release even when interrupted so the next contender is not stuck
    mutex.unlock(&CancellationToken::new()).await?;
    println!("contender {} released", id);
    Ok(())
}

/// Enqueue `items` values, then drain them in order.
pub async fn run_queue(queue: QueueConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let client = new_store();
    let producer = Queue::new(client.clone(), &queue.prefix);
    let consumer = Queue::new(client, &queue.prefix);

    for i in 0..queue.items {
        producer.enqueue(format!("item-{}", i)).await?;
    }
    info!("Enqueued {} items under {}", queue.items, producer.prefix());

    for _ in 0..queue.items {
        let value = consumer.dequeue(&cancel).await?;
        println!("dequeued {}", String::from_utf8_lossy(&value));
    }
    Ok(())
}
