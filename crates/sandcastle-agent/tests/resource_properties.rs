//! Concurrency and lifecycle properties of the resource managers
//!
//! Each test drives one component through the public API the way the
//! control plane does, with many callers interleaving.
//!
//! # Running
//! ```bash
//! cargo test -p sandcastle-agent --test resource_properties
//! ```

use sandcastle_agent::{
    compute_hash, Admission, AdmissionStrategy, ConnectionPool, Connection, Connector,
    PoolConfig, PortAllocator, PortAllocatorConfig, PortRange, ProviderBudget, RateLimiter,
    RateLimiterConfig, SandboxError, ToolDefinition, ToolRegistry,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Port allocation
// =============================================================================

fn port_config(base: u16, per_class: u16) -> PortAllocatorConfig {
    PortAllocatorConfig {
        control_range: PortRange::new(base, base + per_class - 1),
        desktop_range: PortRange::new(base + per_class, base + 2 * per_class - 1),
        terminal_range: PortRange::new(base + 2 * per_class, base + 3 * per_class - 1),
        reservation_ttl: Duration::from_secs(300),
        bind_host: "127.0.0.1".parse().unwrap(),
        auto_assign: false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_are_disjoint() {
    let allocator = Arc::new(PortAllocator::new(port_config(43000, 40)));

    let tasks: Vec<_> = (0..25)
        .map(|i| {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate_ports(&format!("sb-{i}")).await })
        })
        .collect();

    let mut all_ports = Vec::new();
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        all_ports.extend(result.ports());
    }

    let unique: HashSet<u16> = all_ports.iter().copied().collect();
    assert_eq!(all_ports.len(), 75);
    assert_eq!(unique.len(), all_ports.len());
    assert_eq!(allocator.active_port_count().await, 75);
}

#[tokio::test]
async fn released_ports_can_be_reissued() {
    let allocator = PortAllocator::new(port_config(43200, 1));

    let first = allocator.allocate_ports("a").await.unwrap();
    assert!(matches!(
        allocator.allocate_ports("b").await,
        Err(SandboxError::PortsExhausted { .. })
    ));

    let mut freed = allocator.release(first.reservation_id).await;
    freed.sort_unstable();
    assert_eq!(freed, vec![43200, 43201, 43202]);
    assert!(allocator.release(first.reservation_id).await.is_empty());

    let second = allocator.allocate_ports("b").await.unwrap();
    assert_eq!(second.ports(), first.ports());
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_reservation_expires() {
    let allocator = PortAllocator::new(port_config(43300, 1));

    let reservation = allocator.allocate_ports("a").await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;

    assert_eq!(allocator.cleanup_expired().await, 1);
    assert!(!allocator.is_reserved(reservation.control_port).await);

    let again = allocator.allocate_ports("b").await.unwrap();
    assert_eq!(again.control_port, reservation.control_port);
}

// =============================================================================
// Process supervision
// =============================================================================

#[cfg(unix)]
mod processes {
    use sandcastle_agent::{ProcessStatus, ProcessTracker, ProcessTrackerConfig};
    use std::collections::HashMap;
    use std::time::Duration;

    async fn wait_for(tracker: &ProcessTracker, name: &str, status: ProcessStatus) {
        for _ in 0..500 {
            if tracker.get(name).map(|p| p.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{name} never became {status:?}");
    }

    #[tokio::test]
    async fn externally_killed_process_is_crashed() {
        let tracker = ProcessTracker::new(ProcessTrackerConfig::default());
        let process = tracker
            .start_stdio("victim", "sleep", &["30".to_string()], HashMap::new(), None)
            .await
            .unwrap();
        let pid = process.pid.unwrap();

        // SAFETY: pid is our own live child
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }

        wait_for(&tracker, "victim", ProcessStatus::Crashed).await;
        let crashed = tracker.get("victim").unwrap();
        assert!(crashed.pid.is_none());
        assert!(crashed.error.unwrap().contains("signal 9"));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let tracker = ProcessTracker::new(ProcessTrackerConfig::default());
        tracker
            .start_network(
                "server",
                "sh",
                &["-c".to_string(), "exit 42".to_string()],
                HashMap::new(),
                8123,
                None,
            )
            .await
            .unwrap();

        wait_for(&tracker, "server", ProcessStatus::Crashed).await;
        let crashed = tracker.get("server").unwrap();
        assert_eq!(crashed.exit_code, Some(42));
        assert!(crashed.error.unwrap().contains("42"));
    }

    #[tokio::test]
    async fn stop_twice_succeeds() {
        let tracker = ProcessTracker::new(ProcessTrackerConfig::default());
        tracker
            .start_stdio("srv", "cat", &[], HashMap::new(), None)
            .await
            .unwrap();

        assert!(tracker.stop("srv").await);
        assert!(tracker.stop("srv").await);
        let stopped = tracker.get("srv").unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(stopped.pid.is_none());
    }
}

// =============================================================================
// Connection pool
// =============================================================================

struct CountingConnection {
    live: Arc<AtomicUsize>,
    connected: bool,
}

#[async_trait::async_trait]
impl Connection for CountingConnection {
    async fn connect(&mut self, _timeout: Duration) -> bool {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.connected = true;
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.connected = false;
        }
    }
}

struct CountingConnector {
    live: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

impl Connector for CountingConnector {
    type Conn = CountingConnection;

    fn create(&self) -> CountingConnection {
        self.created.fetch_add(1, Ordering::SeqCst);
        CountingConnection {
            live: self.live.clone(),
            connected: false,
        }
    }

    fn endpoint(&self) -> String {
        "test://control".to_string()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_never_creates_more_than_its_size() {
    let pool_size = 4;
    let created = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(AtomicUsize::new(0));
    let pool = ConnectionPool::new(
        CountingConnector {
            live: live.clone(),
            created: created.clone(),
        },
        PoolConfig {
            pool_size,
            connect_timeout: Duration::from_secs(1),
        },
    );

    let tasks: Vec<_> = (0..pool_size + 1)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let conn = pool.get_connection().await.unwrap();
                assert!(conn.is_connected());
                tokio::time::sleep(Duration::from_millis(25)).await;
                pool.return_connection(conn).await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(created.load(Ordering::SeqCst) <= pool_size);
    assert!(live.load(Ordering::SeqCst) <= pool_size);

    pool.close_all().await;
    assert_eq!(live.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Rate limiting
// =============================================================================

fn limiter(strategy: AdmissionStrategy, timeout: Duration) -> RateLimiter {
    RateLimiter::new(RateLimiterConfig {
        strategy,
        default_budget: ProviderBudget::default(),
        providers: HashMap::from([("anthropic".to_string(), ProviderBudget::new(1, timeout))]),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reject_admits_exactly_one() {
    let limiter = limiter(AdmissionStrategy::Reject, Duration::from_secs(60));

    let (a, b) = tokio::join!(limiter.acquire("anthropic"), limiter.acquire("anthropic"));
    let admitted = [&a, &b].iter().filter(|x| x.is_admitted()).count();
    assert_eq!(admitted, 1);

    let metrics = limiter.metrics("anthropic").unwrap();
    assert_eq!(metrics.total_accepted, 1);
    assert_eq!(metrics.total_rejected, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_completes_after_release() {
    let limiter = limiter(AdmissionStrategy::Queue, Duration::from_secs(60));
    let first = limiter.acquire("anthropic").await.into_result().unwrap();

    let second = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire("anthropic").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert_eq!(limiter.metrics("anthropic").unwrap().queued_requests, 1);

    drop(first);
    match second.await.unwrap() {
        Admission::Queued { waited, .. } => assert!(waited >= Duration::from_millis(40)),
        other => panic!("expected a queued admission, got {other:?}"),
    }
}

#[tokio::test]
async fn queue_timeout_rejects_once() {
    let limiter = limiter(AdmissionStrategy::Queue, Duration::from_millis(100));
    let _held = limiter.acquire("anthropic").await.into_result().unwrap();
    let before = limiter.metrics("anthropic").unwrap().total_rejected;

    let err = limiter.acquire("anthropic").await.into_result().unwrap_err();
    assert!(matches!(err, SandboxError::QueueTimeout { .. }));
    assert!(err.is_exhaustion());

    let after = limiter.metrics("anthropic").unwrap().total_rejected;
    assert_eq!(after - before, 1);
}

// =============================================================================
// Tool registry
// =============================================================================

#[test]
fn registry_detects_schema_changes() {
    let registry = ToolRegistry::new();
    let mut tools = vec![
        ToolDefinition {
            name: "screenshot".to_string(),
            description: Some("Capture the screen".to_string()),
            input_schema: json!({"type": "object"}),
        },
        ToolDefinition {
            name: "click".to_string(),
            description: Some("Click".to_string()),
            input_schema: json!({"type": "object", "properties": {"x": {"type": "integer"}}}),
        },
    ];

    assert!(registry.check_updates("sb-1", "desktop", &tools));
    registry.store("sb-1", "desktop", compute_hash(&tools));
    assert!(!registry.check_updates("sb-1", "desktop", &tools));

    tools[1].input_schema = json!({"type": "object", "properties": {"x": {"type": "number"}}});
    assert!(registry.check_updates("sb-1", "desktop", &tools));
}
