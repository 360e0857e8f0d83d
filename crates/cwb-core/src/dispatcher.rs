//! Notification dispatcher: dedup by last-seen hash, then fan out.
//!
//! Every destination is attempted independently. A delivery failure is logged and
//! counted but never stops the other deliveries, and never keeps the hash from being
//! marked seen. Otherwise one unreachable chat would cause the same revision to be
//! re-sent to every reachable chat on each cycle.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    domain::{DestinationId, RepositoryId, RevisionHash, RevisionInfo},
    formatting::{fetch_failure_notice, revision_notice},
    messaging::port::DeliveryPort,
    registry::WatchRegistry,
    source::FetchResult,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// A revision not seen before was delivered and marked seen.
    NewRevision,
    /// The fetched revision was already notified; nothing was sent.
    Unchanged,
    /// The fetch failed and a failure notice was sent.
    FetchFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotifyReport {
    pub outcome: NotifyOutcome,
    pub delivered: usize,
    pub failed: usize,
}

impl NotifyReport {
    fn unchanged() -> Self {
        Self {
            outcome: NotifyOutcome::Unchanged,
            delivered: 0,
            failed: 0,
        }
    }
}

/// Destinations that received the current last-seen revision of a repository.
struct Announced {
    hash: RevisionHash,
    destinations: HashSet<DestinationId>,
}

pub struct NotificationDispatcher {
    registry: Arc<WatchRegistry>,
    messenger: Arc<dyn DeliveryPort>,
    attachment: Option<PathBuf>,
    /// Held for the whole of a notification so cycle and registration notices
    /// never interleave for the same revision.
    announced: Mutex<HashMap<RepositoryId, Announced>>,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<WatchRegistry>, messenger: Arc<dyn DeliveryPort>) -> Self {
        Self {
            registry,
            messenger,
            attachment: None,
            announced: Mutex::new(HashMap::new()),
        }
    }

    /// File sent along with every revision notice, as the notice's caption.
    pub fn with_attachment(mut self, attachment: Option<PathBuf>) -> Self {
        self.attachment = attachment;
        self
    }

    pub async fn notify(
        &self,
        repo: &RepositoryId,
        destinations: &[DestinationId],
        fetched: &FetchResult,
    ) -> NotifyReport {
        let info = match fetched {
            Ok(info) => info,
            Err(err) => {
                let text = fetch_failure_notice(repo, err);
                let (delivered, failed) = self.fan_out(repo, destinations, &text, false).await;
                return NotifyReport {
                    outcome: NotifyOutcome::FetchFailed,
                    delivered,
                    failed,
                };
            }
        };

        let mut announced = self.announced.lock().await;
        if self.registry.last_seen(repo).await.as_ref() == Some(&info.hash) {
            debug!(repo = %repo, hash = %info.hash, "revision already notified");
            return NotifyReport::unchanged();
        }
        self.announce_new(&mut announced, repo, destinations, info)
            .await
    }

    /// Notification for a destination that was just registered.
    ///
    /// When the revision is already the last-seen one, only `dest` is sent the
    /// notice, and only if it has not received it yet. Otherwise the revision is new
    /// to every destination of the repository, so all of them are notified and the
    /// hash is marked seen; the next cycle then has nothing to repeat.
    pub async fn notify_destination(
        &self,
        repo: &RepositoryId,
        dest: DestinationId,
        info: &RevisionInfo,
    ) -> NotifyReport {
        let mut announced = self.announced.lock().await;
        if self.registry.last_seen(repo).await.as_ref() != Some(&info.hash) {
            let mut destinations = self.registry.destinations(repo).await;
            if !destinations.contains(&dest) {
                destinations.push(dest);
            }
            return self
                .announce_new(&mut announced, repo, &destinations, info)
                .await;
        }

        let reached = announced
            .entry(repo.clone())
            .or_insert_with(|| Announced {
                hash: info.hash.clone(),
                destinations: HashSet::new(),
            });
        if reached.hash != info.hash {
            reached.hash = info.hash.clone();
            reached.destinations.clear();
        }
        if reached.destinations.contains(&dest) {
            debug!(repo = %repo, destination = %dest, "destination already has this revision");
            return NotifyReport::unchanged();
        }

        let text = self.revision_text(repo, info);
        let (delivered, failed) = self.fan_out(repo, &[dest], &text, true).await;
        reached.destinations.insert(dest);
        NotifyReport {
            outcome: NotifyOutcome::NewRevision,
            delivered,
            failed,
        }
    }

    async fn announce_new(
        &self,
        announced: &mut HashMap<RepositoryId, Announced>,
        repo: &RepositoryId,
        destinations: &[DestinationId],
        info: &RevisionInfo,
    ) -> NotifyReport {
        let text = self.revision_text(repo, info);
        let (delivered, failed) = self.fan_out(repo, destinations, &text, true).await;
        self.registry.mark_seen(repo, info.hash.clone()).await;
        announced.insert(
            repo.clone(),
            Announced {
                hash: info.hash.clone(),
                destinations: destinations.iter().copied().collect(),
            },
        );

        info!(
            repo = %repo,
            hash = %info.hash,
            delivered,
            failed,
            "new revision notified"
        );
        NotifyReport {
            outcome: NotifyOutcome::NewRevision,
            delivered,
            failed,
        }
    }

    fn revision_text(&self, repo: &RepositoryId, info: &RevisionInfo) -> String {
        let caps = self.messenger.capabilities();
        let max = if self.use_attachment() {
            caps.max_caption_len
        } else {
            caps.max_message_len
        };
        revision_notice(repo, info, max)
    }

    fn use_attachment(&self) -> bool {
        self.attachment.is_some() && self.messenger.capabilities().supports_attachments
    }

    async fn fan_out(
        &self,
        repo: &RepositoryId,
        destinations: &[DestinationId],
        html: &str,
        with_attachment: bool,
    ) -> (usize, usize) {
        let mut delivered = 0usize;
        let mut failed = 0usize;
        for &dest in destinations {
            match self.deliver(dest, html, with_attachment).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!(repo = %repo, destination = %dest, error = %e, "delivery failed");
                }
            }
        }
        (delivered, failed)
    }

    async fn deliver(&self, dest: DestinationId, html: &str, with_attachment: bool) -> Result<()> {
        match &self.attachment {
            Some(path) if with_attachment && self.use_attachment() => {
                self.messenger.send_attachment(dest, path, html).await
            }
            _ => self.messenger.send_html(dest, html).await,
        }
    }
}
