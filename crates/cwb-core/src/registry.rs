//! Watch registry: which repositories are watched by which destinations, plus the
//! last revision each repository was notified for.
//!
//! All state lives in one struct behind one async mutex. Callers get cloned
//! snapshots and must not hold anything from here across network I/O.
//!
//! There is no unwatch operation. A repository stays watched until the state file
//! is edited out-of-band.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{DestinationId, RepositoryId, RevisionHash, WatchEntry, WatchSnapshot};

/// Result of registering a (repository, destination) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyTracked,
    /// Only produced by [`WatchRegistry::add_watch_raw`].
    InvalidRepo,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<WatchEntry>,
    last_seen: HashMap<RepositoryId, Option<RevisionHash>>,
}

impl RegistryState {
    fn entry_mut(&mut self, repo: &RepositoryId) -> Option<&mut WatchEntry> {
        self.entries.iter_mut().find(|e| &e.repo == repo)
    }

    fn entry(&self, repo: &RepositoryId) -> Option<&WatchEntry> {
        self.entries.iter().find(|e| &e.repo == repo)
    }
}

#[derive(Default)]
pub struct WatchRegistry {
    state: Mutex<RegistryState>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from a persisted snapshot. Every repository starts with
    /// no last-seen hash, unless one is supplied in `last_seen`.
    pub fn from_snapshot(
        snapshot: WatchSnapshot,
        last_seen: HashMap<RepositoryId, RevisionHash>,
    ) -> Self {
        let mut st = RegistryState::default();
        for entry in snapshot.entries {
            if st.entry(&entry.repo).is_some() {
                continue;
            }
            let mut destinations: Vec<DestinationId> = Vec::new();
            for d in entry.destinations {
                if !destinations.contains(&d) {
                    destinations.push(d);
                }
            }
            let seen = last_seen.get(&entry.repo).cloned();
            st.last_seen.insert(entry.repo.clone(), seen);
            st.entries.push(WatchEntry {
                repo: entry.repo,
                destinations,
            });
        }
        Self {
            state: Mutex::new(st),
        }
    }

    pub async fn add_watch(&self, repo: RepositoryId, destination: DestinationId) -> AddOutcome {
        let mut st = self.state.lock().await;
        if let Some(entry) = st.entry_mut(&repo) {
            if entry.destinations.contains(&destination) {
                return AddOutcome::AlreadyTracked;
            }
            entry.destinations.push(destination);
            debug!(repo = %repo, destination = %destination, "destination added to existing watch");
            return AddOutcome::Added;
        }

        st.last_seen.insert(repo.clone(), None);
        st.entries.push(WatchEntry {
            repo: repo.clone(),
            destinations: vec![destination],
        });
        debug!(repo = %repo, destination = %destination, "new watch registered");
        AddOutcome::Added
    }

    /// Validate `raw` first; nothing is touched when it is not `owner/name`.
    pub async fn add_watch_raw(&self, raw: &str, destination: DestinationId) -> AddOutcome {
        match RepositoryId::parse(raw) {
            Ok(repo) => self.add_watch(repo, destination).await,
            Err(_) => AddOutcome::InvalidRepo,
        }
    }

    /// Entries in registration order.
    pub async fn list_watches(&self) -> Vec<WatchEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn destinations(&self, repo: &RepositoryId) -> Vec<DestinationId> {
        let st = self.state.lock().await;
        st.entry(repo)
            .map(|e| e.destinations.clone())
            .unwrap_or_default()
    }

    pub async fn last_seen(&self, repo: &RepositoryId) -> Option<RevisionHash> {
        let st = self.state.lock().await;
        st.last_seen.get(repo).cloned().flatten()
    }

    pub async fn mark_seen(&self, repo: &RepositoryId, hash: RevisionHash) {
        let mut st = self.state.lock().await;
        st.last_seen.insert(repo.clone(), Some(hash));
    }

    pub async fn snapshot(&self) -> WatchSnapshot {
        WatchSnapshot {
            entries: self.list_watches().await,
        }
    }

    /// Last-seen hashes of repositories that have one, in registration order.
    pub async fn last_seen_map(&self) -> Vec<(RepositoryId, RevisionHash)> {
        let st = self.state.lock().await;
        st.entries
            .iter()
            .filter_map(|e| {
                st.last_seen
                    .get(&e.repo)
                    .cloned()
                    .flatten()
                    .map(|h| (e.repo.clone(), h))
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
