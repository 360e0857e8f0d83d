use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::DestinationId,
    messaging::{port::DeliveryPort, types::MessagingCapabilities},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same destination (Telegram 1 msg/sec style limits).
    pub per_destination_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_destination_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// DeliveryPort decorator that rate-limits outbound calls.
///
/// A fan-out to many chats stays under the platform's global flood limit, and a burst
/// of notices to one chat is spaced out. Sleeps are cooperative, so other tasks keep
/// running while a delivery waits for its slot.
pub struct ThrottledMessenger {
    inner: Arc<dyn DeliveryPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_destination: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn DeliveryPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_destination: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for(&self, dest: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_destination.lock().await;
        map.entry(dest)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_destination_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle(&self, dest: DestinationId) {
        let global_wait = { self.global.lock().await.reserve() };
        let dest_wait = {
            let lim = self.limiter_for(dest.0).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(dest_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl DeliveryPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, dest: DestinationId, html: &str) -> Result<()> {
        self.throttle(dest).await;
        self.inner.send_html(dest, html).await
    }

    async fn send_attachment(
        &self,
        dest: DestinationId,
        path: &Path,
        caption_html: &str,
    ) -> Result<()> {
        self.throttle(dest).await;
        self.inner.send_attachment(dest, path, caption_html).await
    }
}
