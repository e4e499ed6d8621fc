//! Per-user backend lifecycle coordination
//!
//! Each user's backend moves through `Unstarted -> Starting -> Ready(port)`;
//! `Ready` is terminal for the process lifetime and a failed start falls back
//! to `Unstarted`, where a fresh request may retry it. Starts are
//! single-flight: the first caller to observe `Unstarted` becomes the leader
//! and runs the spawner, every concurrent caller parks on a settle
//! notification, and all parked waiters resume together when the start
//! settles either way.

use crate::error::RouterError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Starts a user's backend and resolves to its port once it accepts traffic.
/// Spawn and health internals live behind this seam.
pub trait BackendSpawner: Send + Sync + 'static {
    fn start(&self, user: &str) -> BoxFuture<'static, anyhow::Result<u16>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unstarted,
    Starting,
    Ready(u16),
}

struct UserBackend {
    phase: Phase,
    /// Fired (valueless) whenever a start settles; waiters re-examine the
    /// phase on wake.
    settled_tx: broadcast::Sender<()>,
}

impl UserBackend {
    fn new() -> Self {
        let (settled_tx, _) = broadcast::channel(16);
        Self {
            phase: Phase::Unstarted,
            settled_tx,
        }
    }
}

/// One row of the diagnostic snapshot
#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub user: String,
    pub state: &'static str,
    pub port: u16,
}

/// Tracks per-user backend readiness. Its only state is the phase (and the
/// port once known); single-flight leadership is decided by the
/// `Unstarted -> Starting` transition under the entry lock.
pub struct LifecycleCoordinator {
    spawner: Arc<dyn BackendSpawner>,
    backends: DashMap<String, Mutex<UserBackend>>,
}

enum Role {
    AlreadyReady(u16),
    Leader,
    Waiter(broadcast::Receiver<()>),
}

/// Settles a claimed start as failed if the leader is dropped or unwinds
/// before reporting an outcome; parked waiters are released and the phase
/// returns to `Unstarted`.
struct StartGuard<'a> {
    coordinator: &'a LifecycleCoordinator,
    user: &'a str,
    armed: bool,
}

impl<'a> StartGuard<'a> {
    fn new(coordinator: &'a LifecycleCoordinator, user: &'a str) -> Self {
        Self {
            coordinator,
            user,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.coordinator.settle(
                self.user,
                Err(anyhow::anyhow!("backend start aborted before completing")),
            );
        }
    }
}

impl LifecycleCoordinator {
    pub fn new(spawner: Arc<dyn BackendSpawner>) -> Arc<Self> {
        Arc::new(Self {
            spawner,
            backends: DashMap::new(),
        })
    }

    /// Port of the user's backend, or 0 while it is not ready
    pub fn port(&self, user: &str) -> u16 {
        self.backends
            .get(user)
            .map(|b| match b.lock().phase {
                Phase::Ready(port) => port,
                _ => 0,
            })
            .unwrap_or(0)
    }

    /// Snapshot of every tracked backend, for diagnostics
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|entry| {
                let phase = entry.value().lock().phase;
                let (state, port) = match phase {
                    Phase::Unstarted => ("unstarted", 0),
                    Phase::Starting => ("starting", 0),
                    Phase::Ready(port) => ("ready", port),
                };
                BackendStatus {
                    user: entry.key().clone(),
                    state,
                    port,
                }
            })
            .collect()
    }

    /// Claim leadership of the next start if the backend is `Unstarted`
    fn take_role(&self, user: &str) -> Role {
        let entry = self
            .backends
            .entry(user.to_string())
            .or_insert_with(|| Mutex::new(UserBackend::new()));
        let mut backend = entry.lock();
        match backend.phase {
            Phase::Ready(port) => Role::AlreadyReady(port),
            Phase::Starting => Role::Waiter(backend.settled_tx.subscribe()),
            Phase::Unstarted => {
                backend.phase = Phase::Starting;
                Role::Leader
            }
        }
    }

    /// Record the outcome of a start and wake every parked waiter
    fn settle(&self, user: &str, result: anyhow::Result<u16>) -> Result<u16, RouterError> {
        let entry = self
            .backends
            .get(user)
            .expect("settling a backend that was never started");
        let mut backend = entry.lock();

        let outcome = match result {
            Ok(port) if port > 0 => {
                backend.phase = Phase::Ready(port);
                info!(user, port, "Backend ready");
                Ok(port)
            }
            Ok(_) => {
                backend.phase = Phase::Unstarted;
                warn!(user, "Backend start returned no port");
                Err(RouterError::BackendStartFailed {
                    user: user.to_string(),
                })
            }
            Err(e) => {
                backend.phase = Phase::Unstarted;
                warn!(user, error = %e, "Backend start failed");
                Err(RouterError::BackendStartFailed {
                    user: user.to_string(),
                })
            }
        };

        // No receivers is fine: nobody was parked.
        let _ = backend.settled_tx.send(());
        outcome
    }

    /// Run the spawner as the elected leader and settle the outcome. A
    /// panicking spawner settles as a failed start; the phase never stays
    /// at `Starting` once the leader is gone.
    async fn run_start(&self, user: &str) -> Result<u16, RouterError> {
        let guard = StartGuard::new(self, user);
        let result = match AssertUnwindSafe(self.spawner.start(user))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("backend spawner panicked")),
        };
        guard.disarm();
        self.settle(user, result)
    }

    /// Kick off the user's backend if it is `Unstarted`. Best-effort: the
    /// result is discarded except for logging, and callers overlap startup
    /// with their other per-request work. Safe to call while a start is in
    /// flight; the in-flight one keeps the lead.
    pub fn ensure_started(self: &Arc<Self>, user: &str) {
        if !matches!(self.take_role(user), Role::Leader) {
            return;
        }
        debug!(user, "Starting backend in the background");
        let coordinator = Arc::clone(self);
        let user = user.to_string();
        tokio::spawn(async move {
            let _ = coordinator.run_start(&user).await;
        });
    }

    /// Resolve the user's backend port, starting the backend if needed and
    /// parking behind an in-flight start otherwise. Every parked caller
    /// resumes when the start settles; a failed settle is this caller's
    /// error while the phase returns to `Unstarted` for the next request.
    pub async fn wait_ready(self: &Arc<Self>, user: &str) -> Result<u16, RouterError> {
        loop {
            match self.take_role(user) {
                Role::AlreadyReady(port) => return Ok(port),
                Role::Leader => return self.run_start(user).await,
                Role::Waiter(mut settled_rx) => {
                    match settled_rx.recv().await {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            // Entry dropped; re-examine from scratch.
                            continue;
                        }
                    }
                    match self.phase(user) {
                        Phase::Ready(port) => return Ok(port),
                        Phase::Unstarted => {
                            return Err(RouterError::BackendStartFailed {
                                user: user.to_string(),
                            })
                        }
                        // A new settle cycle began before we woke; park again.
                        Phase::Starting => continue,
                    }
                }
            }
        }
    }

    fn phase(&self, user: &str) -> Phase {
        self.backends
            .get(user)
            .map(|b| b.lock().phase)
            .unwrap_or(Phase::Unstarted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Spawner that counts starts and can fail the first N of them
    struct MockSpawner {
        starts: AtomicUsize,
        fail_first: usize,
        delay: Duration,
        port: u16,
    }

    impl MockSpawner {
        fn new(port: u16) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                fail_first: 0,
                delay: Duration::from_millis(20),
                port,
            })
        }

        fn failing_first(port: u16, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                fail_first,
                delay: Duration::from_millis(20),
                port,
            })
        }

        fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    impl BackendSpawner for MockSpawner {
        fn start(&self, _user: &str) -> BoxFuture<'static, anyhow::Result<u16>> {
            let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
            let fail = attempt < self.fail_first;
            let delay = self.delay;
            let port = self.port;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if fail {
                    anyhow::bail!("simulated start failure");
                }
                Ok(port)
            })
        }
    }

    #[tokio::test]
    async fn test_wait_ready_starts_once_for_concurrent_waiters() {
        let spawner = MockSpawner::new(9001);
        let coordinator = LifecycleCoordinator::new(spawner.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move { c.wait_ready("alice").await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 9001);
        }
        assert_eq!(spawner.start_count(), 1);
        assert_eq!(coordinator.port("alice"), 9001);
    }

    #[tokio::test]
    async fn test_ensure_started_is_single_flight_with_wait_ready() {
        let spawner = MockSpawner::new(9002);
        let coordinator = LifecycleCoordinator::new(spawner.clone());

        coordinator.ensure_started("bob");
        coordinator.ensure_started("bob");
        let port = coordinator.wait_ready("bob").await.unwrap();

        assert_eq!(port, 9002);
        assert_eq!(spawner.start_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_is_terminal() {
        let spawner = MockSpawner::new(9003);
        let coordinator = LifecycleCoordinator::new(spawner.clone());

        assert_eq!(coordinator.port("carol"), 0);
        coordinator.wait_ready("carol").await.unwrap();
        coordinator.ensure_started("carol");
        coordinator.wait_ready("carol").await.unwrap();

        // Once ready, no further starts happen.
        assert_eq!(spawner.start_count(), 1);
        assert_eq!(coordinator.port("carol"), 9003);
    }

    #[tokio::test]
    async fn test_failed_start_fails_all_waiters_and_is_retryable() {
        let spawner = MockSpawner::failing_first(9004, 1);
        let coordinator = LifecycleCoordinator::new(spawner.clone());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let c = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move { c.wait_ready("dave").await }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(
                result,
                Err(RouterError::BackendStartFailed { .. })
            ));
        }
        assert_eq!(spawner.start_count(), 1);
        assert_eq!(coordinator.port("dave"), 0);

        // A fresh request re-attempts and succeeds.
        assert_eq!(coordinator.wait_ready("dave").await.unwrap(), 9004);
        assert_eq!(spawner.start_count(), 2);
    }

    /// Spawner whose first N starts panic instead of resolving
    struct PanickySpawner {
        starts: AtomicUsize,
        panic_first: usize,
        port: u16,
    }

    impl PanickySpawner {
        fn new(port: u16, panic_first: usize) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                panic_first,
                port,
            })
        }
    }

    impl BackendSpawner for PanickySpawner {
        fn start(&self, _user: &str) -> BoxFuture<'static, anyhow::Result<u16>> {
            let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
            let panic_now = attempt < self.panic_first;
            let port = self.port;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if panic_now {
                    panic!("simulated spawner crash");
                }
                Ok(port)
            })
        }
    }

    #[tokio::test]
    async fn test_panicking_leader_fails_the_start_without_unwinding() {
        let spawner = PanickySpawner::new(9006, 1);
        let coordinator = LifecycleCoordinator::new(spawner);

        let result = coordinator.wait_ready("gwen").await;
        assert!(matches!(
            result,
            Err(RouterError::BackendStartFailed { .. })
        ));
        assert_eq!(coordinator.port("gwen"), 0);

        // The crash left the phase retryable.
        assert_eq!(coordinator.wait_ready("gwen").await.unwrap(), 9006);
    }

    #[tokio::test]
    async fn test_background_start_panic_releases_parked_waiters() {
        let spawner = PanickySpawner::new(9007, 1);
        let coordinator = LifecycleCoordinator::new(spawner);

        coordinator.ensure_started("hank");
        let first = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.wait_ready("hank"),
        )
        .await
        .expect("wait_ready must not park forever after a crashed start");

        // Either this call parked behind the crashed start and observed its
        // failure, or the crash settled first and this call retried as the
        // new leader.
        let port = match first {
            Err(RouterError::BackendStartFailed { .. }) => {
                coordinator.wait_ready("hank").await.unwrap()
            }
            other => other.unwrap(),
        };
        assert_eq!(port, 9007);
        assert_eq!(coordinator.port("hank"), 9007);
    }

    #[tokio::test]
    async fn test_abandoned_leader_start_is_retried() {
        let spawner = MockSpawner::new(9008);
        let coordinator = LifecycleCoordinator::new(spawner);

        let c = Arc::clone(&coordinator);
        let leader = tokio::spawn(async move { c.wait_ready("iris").await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.abort();
        let _ = leader.await;

        // The dropped leader settled back to Unstarted; a fresh request
        // starts over instead of parking behind a ghost.
        let port = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.wait_ready("iris"),
        )
        .await
        .expect("wait_ready must not park behind an abandoned start")
        .unwrap();
        assert_eq!(port, 9008);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let spawner = MockSpawner::new(9005);
        let coordinator = LifecycleCoordinator::new(spawner.clone());

        coordinator.wait_ready("erin").await.unwrap();
        coordinator.wait_ready("frank").await.unwrap();

        assert_eq!(spawner.start_count(), 2);
        let mut snapshot = coordinator.snapshot();
        snapshot.sort_by(|a, b| a.user.cmp(&b.user));
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|s| s.state == "ready"));
    }
}
