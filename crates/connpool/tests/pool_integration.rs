//! End-to-end pool behaviour under concurrent load.

use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use connpool::{
    ConnectionKey, ConnectionPool, ConnectionSupplier, Credentials, DriverError,
    PhysicalConnection, PoolConfig,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Route pool logs to the test writer, filtered by `RUST_LOG`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Fixtures ─────────────────────────────────────────────────────

/// Tracks how many physical connections are open right now and the peak.
#[derive(Debug, Default)]
struct Gauge {
    opened: AtomicUsize,
    open_now: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug)]
struct GaugedConnection {
    gauge: Arc<Gauge>,
    closed: AtomicBool,
}

impl PhysicalConnection for GaugedConnection {
    fn execute(&mut self, _statement: &str) -> Result<u64, DriverError> {
        Ok(0)
    }

    fn is_valid(&mut self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.gauge.open_now.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct GaugedSupplier {
    gauge: Arc<Gauge>,
    open_delay: Duration,
}

impl ConnectionSupplier for GaugedSupplier {
    fn open(
        &self,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn PhysicalConnection>, DriverError> {
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        self.gauge.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.gauge.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(GaugedConnection {
            gauge: Arc::clone(&self.gauge),
            closed: AtomicBool::new(false),
        }))
    }
}

fn gauged_pool(max: usize, ttl: Duration, open_delay: Duration) -> (ConnectionPool, Arc<Gauge>) {
    let gauge = Arc::new(Gauge::default());
    let supplier = Arc::new(GaugedSupplier {
        gauge: Arc::clone(&gauge),
        open_delay,
    });
    let pool = ConnectionPool::new("load", PoolConfig::new(ttl, max).unwrap(), supplier);
    (pool, gauge)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_cap_and_all_complete() {
    init_tracing();
    const CAP: usize = 3;
    const CALLERS: usize = 24;

    let (pool, gauge) = gauged_pool(CAP, Duration::from_secs(3600), Duration::from_millis(2));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..CALLERS {
        let pool = pool.clone();
        let completed = Arc::clone(&completed);
        tasks.push(tokio::spawn(async move {
            let mut conn = pool.acquire(&ConnectionKey::Default).await.unwrap();
            conn.execute(&format!("SELECT {i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            conn.release();
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Sample the invariant while the load runs.
    let sampler = {
        let pool = pool.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let stats = pool.stats();
                assert_eq!(stats.live, stats.idle + stats.active + stats.opening);
                assert!(stats.live <= CAP, "{stats:?}");
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        for task in tasks {
            task.await.unwrap();
        }
    })
    .await
    .expect("all callers must eventually complete");
    sampler.await.unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), CALLERS);
    assert!(gauge.peak.load(Ordering::SeqCst) <= CAP);
    assert!(gauge.opened.load(Ordering::SeqCst) <= CAP);

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.live, stats.idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_keys_make_progress_under_a_shared_cap() {
    init_tracing();
    let (pool, gauge) = gauged_pool(2, Duration::from_secs(3600), Duration::ZERO);
    let keys = [
        ConnectionKey::Default,
        ConnectionKey::with_credentials("reporting", "r"),
        ConnectionKey::with_credentials("app", "a"),
    ];

    let mut tasks = Vec::new();
    for i in 0..30 {
        let pool = pool.clone();
        let key = keys[i % keys.len()].clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire(&key).await.unwrap();
            assert_eq!(conn.key(), &key);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }));
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        for task in tasks {
            task.await.unwrap();
        }
    })
    .await
    .expect("no key may starve while capacity is idle under another key");

    assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn ttl_recycles_physical_connection() {
    init_tracing();
    let (pool, gauge) = gauged_pool(4, Duration::from_millis(100), Duration::ZERO);
    let key = ConnectionKey::with_credentials("app", "secret");

    let first = pool.acquire(&key).await.unwrap();
    let first_id = first.id();
    first.release();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = pool.acquire(&key).await.unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(second.key(), &key);
    assert!(second.age() < Duration::from_millis(100));
    assert_eq!(gauge.opened.load(Ordering::SeqCst), 2);
    assert_eq!(gauge.open_now.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_leaves_no_open_connections() {
    init_tracing();
    let (pool, gauge) = gauged_pool(4, Duration::from_secs(3600), Duration::ZERO);
    let held = pool.acquire(&ConnectionKey::Default).await.unwrap();
    pool.acquire(&ConnectionKey::Default).await.unwrap().release();
    pool.acquire(&ConnectionKey::with_credentials("app", "a"))
        .await
        .unwrap()
        .release();

    assert_eq!(pool.shutdown(), 3);
    assert_eq!(gauge.open_now.load(Ordering::SeqCst), 0);
    drop(held);
    assert_eq!(pool.stats().live, 0);
}
