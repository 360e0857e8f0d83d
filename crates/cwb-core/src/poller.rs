//! Poll scheduler: the background loop that checks every watched repository.
//!
//! One cycle:
//! - snapshot the registry
//! - for each repository: fetch the latest revision, hand it to the dispatcher,
//!   then wait `repo_throttle` before the next repository
//! - persist the registry
//!
//! Cycles repeat every `cycle_interval` until the cancellation token fires.
//! Rate-limit responses are logged with their reset time but do not pause the cycle.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    dispatcher::{NotificationDispatcher, NotifyOutcome, NotifyReport},
    domain::{DestinationId, RepositoryId, RevisionInfo},
    registry::WatchRegistry,
    source::{FetchError, FetchResult, RevisionSource},
    store::WatchStore,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    /// Sleep between two full cycles.
    pub cycle_interval: Duration,
    /// Delay between two repositories within a cycle.
    pub repo_throttle: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(60),
            repo_throttle: Duration::from_secs(1),
        }
    }
}

impl PollConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            cycle_interval: cfg.poll_interval,
            repo_throttle: cfg.repo_throttle,
        }
    }
}

/// Totals for one pass over the registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub repositories: usize,
    pub new_revisions: usize,
    pub fetch_failures: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
    pub saved: bool,
}

impl CycleReport {
    fn record(&mut self, report: &NotifyReport) {
        match report.outcome {
            NotifyOutcome::NewRevision => self.new_revisions += 1,
            NotifyOutcome::FetchFailed => self.fetch_failures += 1,
            NotifyOutcome::Unchanged => {}
        }
        self.delivered += report.delivered;
        self.failed_deliveries += report.failed;
    }
}

#[derive(Clone)]
pub struct Poller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    cfg: PollConfig,
    registry: Arc<WatchRegistry>,
    source: Arc<dyn RevisionSource>,
    dispatcher: Arc<NotificationDispatcher>,
    store: Arc<WatchStore>,
    /// Snapshot and write happen under this lock, so an older snapshot can never
    /// overwrite a newer one on disk.
    save_lock: Mutex<()>,
}

/// Wait before restarting a poll loop that died.
const RESTART_DELAY: Duration = Duration::from_secs(5);

impl Poller {
    pub fn new(
        cfg: PollConfig,
        registry: Arc<WatchRegistry>,
        source: Arc<dyn RevisionSource>,
        dispatcher: Arc<NotificationDispatcher>,
        store: Arc<WatchStore>,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                cfg,
                registry,
                source,
                dispatcher,
                store,
                save_lock: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.inner.registry
    }

    /// Run cycles until `cancel` fires. Cancellation is checked between cycles and
    /// during the inter-cycle sleep, never in the middle of a cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.inner.cfg.cycle_interval.as_secs(),
            throttle_ms = self.inner.cfg.repo_throttle.as_millis() as u64,
            "poll loop started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let report = self.run_cycle().await;
            if report.repositories > 0 {
                info!(
                    repos = report.repositories,
                    new = report.new_revisions,
                    fetch_failures = report.fetch_failures,
                    delivered = report.delivered,
                    failed = report.failed_deliveries,
                    "poll cycle finished"
                );
            }

            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = sleep(self.inner.cfg.cycle_interval) => {}
            }
        }
        info!("poll loop stopped");
    }

    /// Run the poll loop on its own task and restart it if it dies, until `cancel`
    /// fires.
    pub async fn supervise(&self, cancel: CancellationToken) {
        loop {
            let task = {
                let poller = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { poller.run(cancel).await })
            };
            match task.await {
                Ok(()) if cancel.is_cancelled() => return,
                Ok(()) => error!("poll loop returned before shutdown"),
                Err(e) => error!(error = %e, "poll loop died"),
            }

            tokio::select! {
              _ = cancel.cancelled() => return,
              _ = sleep(RESTART_DELAY) => {}
            }
            warn!("restarting poll loop");
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let watches = self.inner.registry.list_watches().await;
        let mut report = CycleReport {
            repositories: watches.len(),
            ..CycleReport::default()
        };

        for (idx, entry) in watches.iter().enumerate() {
            if idx > 0 && self.inner.cfg.repo_throttle > Duration::ZERO {
                sleep(self.inner.cfg.repo_throttle).await;
            }

            let fetched = self.inner.source.fetch_latest(&entry.repo).await;
            if let Err(e) = &fetched {
                log_fetch_error(&entry.repo, e);
            }

            let notified = self
                .inner
                .dispatcher
                .notify(&entry.repo, &entry.destinations, &fetched)
                .await;
            report.record(&notified);
        }

        // A failed save is retried by the next cycle's save.
        report.saved = match self.save_now().await {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.inner.store.path().display(), error = %e, "failed to persist watch state");
                false
            }
        };
        report
    }

    /// One fetch outside the cycle (used to validate a registration).
    pub async fn fetch_now(&self, repo: &RepositoryId) -> FetchResult {
        let fetched = self.inner.source.fetch_latest(repo).await;
        if let Err(e) = &fetched {
            log_fetch_error(repo, e);
        }
        fetched
    }

    /// Tell a newly registered destination about `revision`.
    pub async fn announce(
        &self,
        repo: &RepositoryId,
        dest: DestinationId,
        revision: &RevisionInfo,
    ) -> NotifyReport {
        self.inner
            .dispatcher
            .notify_destination(repo, dest, revision)
            .await
    }

    /// Persist the registry (and last-seen hashes when enabled).
    pub async fn save_now(&self) -> Result<()> {
        let _guard = self.inner.save_lock.lock().await;
        let snapshot = self.inner.registry.snapshot().await;
        self.inner.store.save(&snapshot)?;
        if self.inner.store.persists_last_seen() {
            let seen = self.inner.registry.last_seen_map().await;
            self.inner.store.save_last_seen(&seen)?;
        }
        Ok(())
    }
}

fn log_fetch_error(repo: &RepositoryId, err: &FetchError) {
    match err {
        FetchError::RateLimited { retry_after } => {
            warn!(repo = %repo, retry_after = %retry_after, "revision API rate limit reached")
        }
        other => warn!(repo = %repo, error = %other, "failed to fetch latest revision"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        path::PathBuf,
        sync::Mutex,
    };

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        dispatcher::tests::FakeMessenger,
        domain::{RevisionHash, RevisionInfo},
        source::FetchResult,
    };

    /// Scripted responses per repository; the last response repeats.
    #[derive(Default)]
    struct FakeSource {
        script: Mutex<HashMap<String, VecDeque<FetchResult>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl FakeSource {
        fn push(&self, repo: &str, result: FetchResult) {
            self.script
                .lock()
                .unwrap()
                .entry(repo.to_string())
                .or_default()
                .push_back(result);
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RevisionSource for FakeSource {
        async fn fetch_latest(&self, repo: &RepositoryId) -> FetchResult {
            self.calls
                .lock()
                .unwrap()
                .push((repo.to_string(), Instant::now()));
            let mut script = self.script.lock().unwrap();
            let queue = script.entry(repo.to_string()).or_default();
            match queue.len() {
                0 => Err(FetchError::Transport("no scripted response".into())),
                1 => queue[0].clone(),
                _ => queue.pop_front().unwrap_or_else(|| Err(FetchError::Malformed("empty".into()))),
            }
        }
    }

    fn rev(hash: &str, author: &str) -> FetchResult {
        Ok(RevisionInfo {
            message: format!("commit {hash}"),
            author: author.to_string(),
            hash: RevisionHash(hash.to_string()),
        })
    }

    fn repo(s: &str) -> RepositoryId {
        RepositoryId::parse(s).unwrap()
    }

    fn tmp_state(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        PathBuf::from(format!("/tmp/{prefix}-{}-{ts}/watches.json", std::process::id()))
    }

    struct Harness {
        poller: Poller,
        registry: Arc<WatchRegistry>,
        source: Arc<FakeSource>,
        messenger: Arc<FakeMessenger>,
        store: Arc<WatchStore>,
    }

    fn harness(cfg: PollConfig, messenger: FakeMessenger, persist_last_seen: bool) -> Harness {
        let registry = Arc::new(WatchRegistry::new());
        let source = Arc::new(FakeSource::default());
        let messenger = Arc::new(messenger);
        let store = Arc::new(WatchStore::new(tmp_state("cwb-poller"), persist_last_seen));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            registry.clone(),
            messenger.clone(),
        ));
        let poller = Poller::new(
            cfg,
            registry.clone(),
            source.clone(),
            dispatcher,
            store.clone(),
        );
        Harness {
            poller,
            registry,
            source,
            messenger,
            store,
        }
    }

    fn no_delay() -> PollConfig {
        PollConfig {
            cycle_interval: Duration::ZERO,
            repo_throttle: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn cycles_follow_the_widgets_scenario_and_persist() {
        let h = harness(no_delay(), FakeMessenger::default(), false);
        let general = DestinationId(-100);
        h.registry.add_watch(repo("acme/widgets"), general).await;
        h.source.push("acme/widgets", rev("abc123", "alice"));
        h.source.push("acme/widgets", rev("abc123", "alice"));
        h.source.push("acme/widgets", rev("def456", "bob"));

        let first = h.poller.run_cycle().await;
        assert_eq!(first.new_revisions, 1);
        assert!(first.saved);
        assert_eq!(h.store.load().unwrap(), h.registry.snapshot().await);

        let second = h.poller.run_cycle().await;
        assert_eq!(second.new_revisions, 0);
        assert_eq!(second.delivered, 0);

        let third = h.poller.run_cycle().await;
        assert_eq!(third.new_revisions, 1);
        assert_eq!(h.messenger.sent_to(general).len(), 2);
        assert_eq!(
            h.registry.last_seen(&repo("acme/widgets")).await,
            Some(RevisionHash("def456".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repositories_are_throttled_within_a_cycle() {
        let cfg = PollConfig {
            cycle_interval: Duration::from_secs(60),
            repo_throttle: Duration::from_millis(750),
        };
        let h = harness(cfg, FakeMessenger::default(), false);
        for name in ["acme/a", "acme/b", "acme/c"] {
            h.registry.add_watch(repo(name), DestinationId(1)).await;
            h.source.push(name, rev("h", "x"));
        }

        h.poller.run_cycle().await;
        let calls = h.source.calls();
        let order: Vec<&str> = calls.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(order, vec!["acme/a", "acme/b", "acme/c"]);
        for pair in calls.windows(2) {
            assert!(pair[1].1.duration_since(pair[0].1) >= Duration::from_millis(750));
        }
    }

    #[tokio::test]
    async fn rate_limited_repository_does_not_stop_the_cycle() {
        let h = harness(no_delay(), FakeMessenger::default(), false);
        h.registry.add_watch(repo("acme/limited"), DestinationId(1)).await;
        h.registry.add_watch(repo("acme/fine"), DestinationId(2)).await;
        h.source.push(
            "acme/limited",
            Err(FetchError::RateLimited {
                retry_after: Utc::now(),
            }),
        );
        h.source.push("acme/fine", rev("abc", "alice"));

        let report = h.poller.run_cycle().await;
        assert_eq!(report.fetch_failures, 1);
        assert_eq!(report.new_revisions, 1);
        assert_eq!(h.messenger.sent_to(DestinationId(2)).len(), 1);
        // The limited repository's destination still hears about the failure.
        assert_eq!(h.messenger.sent_to(DestinationId(1)).len(), 1);
    }

    #[tokio::test]
    async fn failed_save_is_reported_and_retried_next_cycle() {
        let h = harness(no_delay(), FakeMessenger::default(), false);
        h.registry.add_watch(repo("acme/widgets"), DestinationId(1)).await;
        h.source.push("acme/widgets", rev("abc", "alice"));

        // A directory where the state file should be makes the rename fail.
        std::fs::create_dir_all(h.store.path()).unwrap();
        assert!(!h.poller.run_cycle().await.saved);

        std::fs::remove_dir_all(h.store.path()).unwrap();
        assert!(h.poller.run_cycle().await.saved);
        assert_eq!(h.store.load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_re_notifies_unless_last_seen_is_persisted() {
        for persist in [false, true] {
            let h = harness(no_delay(), FakeMessenger::default(), persist);
            h.registry.add_watch(repo("acme/widgets"), DestinationId(1)).await;
            h.source.push("acme/widgets", rev("abc123", "alice"));
            h.poller.run_cycle().await;

            // Simulated restart: rebuild everything from disk.
            let registry = Arc::new(WatchRegistry::from_snapshot(
                h.store.load().unwrap(),
                h.store.load_last_seen().unwrap(),
            ));
            let messenger = Arc::new(FakeMessenger::default());
            let dispatcher = Arc::new(NotificationDispatcher::new(
                registry.clone(),
                messenger.clone(),
            ));
            let poller = Poller::new(
                no_delay(),
                registry,
                h.source.clone(),
                dispatcher,
                h.store.clone(),
            );
            poller.run_cycle().await;

            let expected = if persist { 0 } else { 1 };
            assert_eq!(messenger.sent().len(), expected, "persist_last_seen={persist}");
        }
    }

    #[tokio::test]
    async fn fetch_now_then_announce_reaches_only_the_new_destination() {
        let h = harness(no_delay(), FakeMessenger::default(), false);
        let old = DestinationId(1);
        let new = DestinationId(2);
        h.registry.add_watch(repo("acme/widgets"), old).await;
        h.source.push("acme/widgets", rev("abc", "alice"));
        h.poller.run_cycle().await;

        h.registry.add_watch(repo("acme/widgets"), new).await;
        let Ok(info) = h.poller.fetch_now(&repo("acme/widgets")).await else {
            panic!("scripted fetch failed");
        };
        let report = h.poller.announce(&repo("acme/widgets"), new, &info).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(h.messenger.sent_to(old).len(), 1);
        assert_eq!(h.messenger.sent_to(new).len(), 1);

        h.poller.run_cycle().await;
        assert_eq!(h.messenger.sent().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_never_lose_a_registration() {
        let h = harness(no_delay(), FakeMessenger::default(), false);
        let mut tasks = Vec::new();
        for i in 0..32 {
            let poller = h.poller.clone();
            let registry = h.registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .add_watch(repo(&format!("acme/r{i}")), DestinationId(i))
                    .await;
                poller.save_now().await
            }));
            let poller = h.poller.clone();
            tasks.push(tokio::spawn(async move { poller.save_now().await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let on_disk = h.store.load().unwrap();
        assert_eq!(on_disk.len(), 32);
        assert_eq!(on_disk, h.registry.snapshot().await);
    }

    /// Panics on the first fetch, then cancels the loop on the second.
    struct PanicOnceSource {
        calls: Mutex<usize>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl RevisionSource for PanicOnceSource {
        async fn fetch_latest(&self, _repo: &RepositoryId) -> FetchResult {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 1 {
                panic!("upstream blew up");
            }
            self.cancel.cancel();
            Err(FetchError::Transport("stopping".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn supervise_restarts_a_panicked_loop() {
        let cancel = CancellationToken::new();
        let source = Arc::new(PanicOnceSource {
            calls: Mutex::new(0),
            cancel: cancel.clone(),
        });
        let registry = Arc::new(WatchRegistry::new());
        registry.add_watch(repo("acme/widgets"), DestinationId(1)).await;
        let dispatcher = Arc::new(NotificationDispatcher::new(
            registry.clone(),
            Arc::new(FakeMessenger::default()),
        ));
        let poller = Poller::new(
            PollConfig {
                cycle_interval: Duration::from_secs(3600),
                repo_throttle: Duration::ZERO,
            },
            registry,
            source.clone(),
            dispatcher,
            Arc::new(WatchStore::new(tmp_state("cwb-supervise"), false)),
        );

        tokio::time::timeout(Duration::from_secs(60), poller.supervise(cancel.clone()))
            .await
            .unwrap();
        assert_eq!(*source.calls.lock().unwrap(), 2);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let h = harness(
            PollConfig {
                cycle_interval: Duration::from_secs(3600),
                repo_throttle: Duration::ZERO,
            },
            FakeMessenger::default(),
            false,
        );
        let cancel = CancellationToken::new();
        let poller = h.poller.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { poller.run(token).await });

        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
