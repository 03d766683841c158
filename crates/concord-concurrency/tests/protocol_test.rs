//! Concord Concurrency Protocol Tests
//!
//! Exercise the mutex and queue protocols end to end against the in-process
//! store: exclusion, arrival-order fairness, hand-over on unlock, crash
//! recovery through lease expiry and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use concord_concurrency::{
    CancellationToken, ConcurrencyError, Mutex, MutexState, Queue, Session, SessionConfig,
};
use concord_store::{GetOptions, KvClient, MemoryStore};
use tokio::sync::mpsc;

fn new_store() -> (Arc<MemoryStore>, Arc<dyn KvClient>) {
    let store = Arc::new(MemoryStore::new());
    let client: Arc<dyn KvClient> = store.clone();
    (store, client)
}

async fn contender_count(client: &Arc<dyn KvClient>, prefix: &str) -> usize {
    client
        .get(format!("{}/", prefix).into_bytes(), GetOptions::prefix())
        .await
        .unwrap()
        .kvs
        .len()
}

/// Wait until `n` candidate keys exist under the prefix.
async fn wait_for_contenders(client: &Arc<dyn KvClient>, prefix: &str, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while contender_count(client, prefix).await < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ============== Mutex ==============

#[tokio::test(start_paused = true)]
async fn test_two_sessions_hand_over_lock() {
    let (_store, client) = new_store();
    let s1 = Session::open(client.clone()).await.unwrap();
    let s2 = Session::open(client.clone()).await.unwrap();
    let pfx = "/TestMutexBasics";
    let ctx = CancellationToken::new();

    let mut m1 = Mutex::new(&s1, pfx);
    m1.lock(&ctx).await.unwrap();
    let r1 = m1.revision();

    let m2_task = {
        let mut m2 = Mutex::new(&s2, pfx);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let res = m2.lock(&ctx).await;
            (m2, res)
        })
    };
    wait_for_contenders(&client, pfx, 2).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!m2_task.is_finished());

    m1.unlock(&ctx).await.unwrap();
    let (m2, res) = m2_task.await.unwrap();
    res.unwrap();

    // create(s1) < create(s2) < delete(s1) <= the read that let s2 proceed
    let r2 = m2.revision();
    assert!(r1 < r2);
    assert!(m2.header().unwrap().revision > r2);
    assert_eq!(m2.state(), MutexState::Locked);

    s1.close().await.unwrap();
    s2.close().await.unwrap();
}

#[tokio::test]
async fn test_mutual_exclusion_under_contention() {
    let (_store, client) = new_store();
    let in_critical = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let in_critical = in_critical.clone();
        let entries = entries.clone();
        tasks.push(tokio::spawn(async move {
            let session = Session::open(client).await.unwrap();
            let mut mutex = Mutex::new(&session, "/exclusive");
            let ctx = CancellationToken::new();
            for _ in 0..3 {
                mutex.lock(&ctx).await.unwrap();
                assert!(!in_critical.swap(true, Ordering::SeqCst));
                entries.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_critical.store(false, Ordering::SeqCst);
                mutex.unlock(&ctx).await.unwrap();
            }
            session.close().await.unwrap();
        }));
    }

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(entries.load(Ordering::SeqCst), 24);
}

#[tokio::test]
async fn test_lock_granted_in_arrival_order() {
    let (_store, client) = new_store();
    let pfx = "/fifo";
    let ctx = CancellationToken::new();

    let holder_session = Session::open(client.clone()).await.unwrap();
    let mut holder = Mutex::new(&holder_session, pfx);
    holder.lock(&ctx).await.unwrap();

    let (order_tx, mut order_rx) = mpsc::unbounded_channel();
    let mut sessions = Vec::new();
    let mut tasks = Vec::new();
    for id in 0..5 {
        let session = Arc::new(Session::open(client.clone()).await.unwrap());
        let mut mutex = Mutex::new(&session, pfx);
        let order_tx = order_tx.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            mutex.lock(&ctx).await.unwrap();
            order_tx.send(id).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            mutex.unlock(&ctx).await.unwrap();
        }));
        sessions.push(session);
        // make sure contender `id` has committed its key before the next one starts
        wait_for_contenders(&client, pfx, id + 2).await;
    }

    holder.unlock(&ctx).await.unwrap();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
    }

    let mut order = Vec::new();
    while let Ok(id) = order_rx.try_recv() {
        order.push(id);
    }
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_closing_holder_session_releases_lock() {
    let (_store, client) = new_store();
    let s1 = Session::open(client.clone()).await.unwrap();
    let s2 = Session::open(client.clone()).await.unwrap();
    let ctx = CancellationToken::new();

    let mut m1 = Mutex::new(&s1, "/closing");
    m1.lock(&ctx).await.unwrap();

    let waiter = {
        let mut m2 = Mutex::new(&s2, "/closing");
        let ctx = ctx.clone();
        tokio::spawn(async move { m2.lock(&ctx).await })
    };
    wait_for_contenders(&client, "/closing", 2).await;

    s1.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_evicted_by_lease_expiry() {
    let store = Arc::new(MemoryStore::new().with_lease_reaper(Duration::from_millis(200)));
    let client: Arc<dyn KvClient> = store.clone();
    let ctx = CancellationToken::new();

    let crashed = Session::open_with_config(client.clone(), SessionConfig::default().with_ttl(5))
        .await
        .unwrap();
    let mut m1 = Mutex::new(&crashed, "/crash");
    m1.lock(&ctx).await.unwrap();
    // the holder stops renewing without unlocking
    crashed.orphan().await;

    let s2 = Session::open(client.clone()).await.unwrap();
    let mut m2 = Mutex::new(&s2, "/crash");
    let started = tokio::time::Instant::now();
    m2.lock(&ctx).await.unwrap();

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(4));
    assert!(waited <= Duration::from_secs(6));
}

#[tokio::test]
async fn test_canceled_lock_leaves_no_key() {
    let (_store, client) = new_store();
    let s1 = Session::open(client.clone()).await.unwrap();
    let s2 = Session::open(client.clone()).await.unwrap();
    let s3 = Session::open(client.clone()).await.unwrap();

    let mut m1 = Mutex::new(&s1, "/cancel");
    m1.lock(&CancellationToken::new()).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let mut m2 = Mutex::new(&s2, "/cancel");
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let res = m2.lock(&cancel).await;
            (m2, res)
        })
    };
    wait_for_contenders(&client, "/cancel", 2).await;

    cancel.cancel();
    let (m2, res) = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(ConcurrencyError::Canceled)));
    assert_eq!(m2.state(), MutexState::Unlocked);
    assert_eq!(m2.revision(), -1);
    assert_eq!(contender_count(&client, "/cancel").await, 1);

    // a later contender is only behind the real holder
    let third = {
        let mut m3 = Mutex::new(&s3, "/cancel");
        tokio::spawn(async move { m3.lock(&CancellationToken::new()).await })
    };
    wait_for_contenders(&client, "/cancel", 2).await;
    m1.unlock(&CancellationToken::new()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), third)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_independent_prefixes_on_one_session() {
    let (_store, client) = new_store();
    let session = Session::open(client.clone()).await.unwrap();
    let ctx = CancellationToken::new();

    let mut a = Mutex::new(&session, "/res/a");
    let mut b = Mutex::new(&session, "/res/b");
    a.lock(&ctx).await.unwrap();
    b.lock(&ctx).await.unwrap();
    assert_ne!(a.key(), b.key());

    a.unlock(&ctx).await.unwrap();
    b.unlock(&ctx).await.unwrap();
}

// ============== Queue ==============

#[tokio::test]
async fn test_queue_fifo_across_instances() {
    let (_store, client) = new_store();
    let producer = Queue::new(client.clone(), "/queue");
    let consumer = Queue::new(client.clone(), "/queue");
    let ctx = CancellationToken::new();

    for i in 0..10 {
        producer.enqueue(format!("v{}", i)).await.unwrap();
    }
    for i in 0..10 {
        let value = consumer.dequeue(&ctx).await.unwrap();
        assert_eq!(String::from_utf8(value).unwrap(), format!("v{}", i));
    }
}

#[tokio::test]
async fn test_queue_blocked_consumers_all_served() {
    let (_store, client) = new_store();
    let ctx = CancellationToken::new();

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let queue = Queue::new(client.clone(), "/handoff");
        let ctx = ctx.clone();
        consumers.push(tokio::spawn(async move { queue.dequeue(&ctx).await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let producer = Queue::new(client.clone(), "/handoff");
    for value in ["a", "b", "c"] {
        producer.enqueue(value).await.unwrap();
    }

    let mut got = Vec::new();
    for consumer in consumers {
        let value = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        got.push(String::from_utf8(value).unwrap());
    }
    got.sort();
    assert_eq!(got, vec!["a", "b", "c"]);
}
