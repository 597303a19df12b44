//! Behavioral tests for key routing and requeue policy of the worker pool.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use drover_core::{Error, ObjectId};
use drover_pool::{Action, Matcher, Pool, PoolConfig, Status};

fn fast_config() -> PoolConfig {
    PoolConfig::default()
        .with_workers(4)
        .with_backoff(1, 10)
        .with_tick_interval(Duration::from_millis(20))
}

struct Recorder {
    seen: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Action for Recorder {
    async fn command(&self, _pool: &Pool, command: &str) -> Status {
        let _ = self.seen.send(format!("command {command}"));
        Status::done()
    }

    async fn reconcile(&self, _pool: &Pool, key: &str) -> Status {
        let _ = self.seen.send(format!("reconcile {key}"));
        Status::done()
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn given_command_and_object_keys_when_processed_then_routed_to_command_and_reconcile() {
    let pool = Pool::new("routing", fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.add_action(
        Matcher::pattern("cmd:namespace:*").unwrap(),
        Arc::new(Recorder { seen: tx.clone() }),
    );
    pool.add_action(Matcher::pattern("obj:*").unwrap(), Arc::new(Recorder { seen: tx }));
    pool.start();

    pool.enqueue_command("namespace:ns");
    assert_eq!(next(&mut rx).await, "command namespace:ns");
    pool.enqueue_key(&ObjectId::new("Value", "ns", "a"));
    assert_eq!(next(&mut rx).await, "reconcile obj:Value/ns/a");

    pool.shutdown();
    pool.wait().await;
}

struct Flaky {
    calls: AtomicUsize,
    fail_until: usize,
    temporary: bool,
    done: mpsc::UnboundedSender<usize>,
}

#[async_trait]
impl Action for Flaky {
    async fn reconcile(&self, _pool: &Pool, _key: &str) -> Status {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.fail_until {
            if self.temporary {
                return Status::retry_later(Error::busy("flaky"));
            }
            return Status::repeat();
        }
        let _ = self.done.send(call);
        Status::done()
    }
}

#[tokio::test]
async fn given_temporary_errors_when_retried_with_backoff_then_key_eventually_completes() {
    let pool = Pool::new("retry", fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.add_action(
        Matcher::exact("flaky"),
        Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_until: 4,
            temporary: true,
            done: tx,
        }),
    );
    pool.start();
    pool.enqueue_raw("flaky");

    let calls = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls, 4);
    pool.shutdown();
    pool.wait().await;
}

#[tokio::test]
async fn given_incomplete_status_when_returned_then_key_is_requeued_immediately() {
    let pool = Pool::new("repeat", fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.add_action(
        Matcher::exact("again"),
        Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_until: 3,
            temporary: false,
            done: tx,
        }),
    );
    pool.start();
    pool.enqueue_raw("again");

    let calls = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(calls, 3);
    pool.shutdown();
    pool.wait().await;
}

struct Exclusive {
    active: AtomicBool,
    overlap: AtomicBool,
    runs: AtomicUsize,
}

#[async_trait]
impl Action for Exclusive {
    async fn reconcile(&self, pool: &Pool, key: &str) -> Status {
        if self.active.swap(true, Ordering::SeqCst) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        // re-add the own key while holding it
        pool.enqueue_raw(key);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.store(false, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Status::done()
    }
}

#[tokio::test]
async fn given_key_added_while_processing_when_many_workers_then_never_processed_concurrently() {
    let pool = Pool::new("exclusive", fast_config().with_workers(8));
    let action = Arc::new(Exclusive {
        active: AtomicBool::new(false),
        overlap: AtomicBool::new(false),
        runs: AtomicUsize::new(0),
    });
    pool.add_action(Matcher::exact("same"), Arc::clone(&action) as Arc<dyn Action>);
    pool.start();
    for _ in 0..20 {
        pool.enqueue_raw("same");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.shutdown();
    pool.wait().await;

    assert!(action.runs.load(Ordering::SeqCst) > 1);
    assert!(!action.overlap.load(Ordering::SeqCst));
}

#[tokio::test]
async fn given_started_pool_when_tick_runs_then_heartbeat_is_recorded() {
    let pool = Pool::new("tick", fast_config());
    pool.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pool.last_heartbeat().is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(pool.is_healthy(Duration::from_secs(5)));

    pool.shutdown();
    pool.wait().await;
}

#[tokio::test]
async fn given_shutdown_when_waiting_then_workers_exit() {
    let pool = Pool::new("shutdown", fast_config());
    pool.start();
    pool.shutdown();
    tokio::time::timeout(Duration::from_secs(5), pool.wait())
        .await
        .unwrap();
    pool.enqueue_raw("ignored");
    assert_eq!(pool.queued(), 0);
}
