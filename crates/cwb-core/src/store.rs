//! Durable JSON snapshot of the watch registry.
//!
//! File format (registration order is kept):
//!
//! ```json
//! { "acme/widgets": [-1001234, 42], "acme/gadgets": [42] }
//! ```
//!
//! Writes are atomic: serialize, write `<file>.tmp.<pid>`, fsync, rename over the
//! target, fsync the directory. A crash at any point leaves either the old or the
//! new file in place, and temp files are never read back.
//!
//! Last-seen hashes are only persisted when enabled, in a sidecar file
//! `<stem>.seen.json` written with the same protocol.

use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    domain::{DestinationId, RepositoryId, RevisionHash, WatchEntry, WatchSnapshot},
    errors::Error,
    Result,
};

pub struct WatchStore {
    path: PathBuf,
    persist_last_seen: bool,
    write_lock: Mutex<()>,
}

impl WatchStore {
    pub fn new(path: impl Into<PathBuf>, persist_last_seen: bool) -> Self {
        Self {
            path: path.into(),
            persist_last_seen,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persists_last_seen(&self) -> bool {
        self.persist_last_seen
    }

    pub fn seen_path(&self) -> PathBuf {
        self.path.with_extension("seen.json")
    }

    /// Load the registry snapshot. A missing or empty file is an empty snapshot;
    /// malformed per-repository entries are skipped.
    pub fn load(&self) -> Result<WatchSnapshot> {
        let Some(txt) = read_optional(&self.path)? else {
            return Ok(WatchSnapshot::default());
        };
        parse_snapshot(&txt).map_err(|reason| Error::Persistence {
            path: self.path.clone(),
            reason,
        })
    }

    pub fn save(&self, snapshot: &WatchSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&render_snapshot(snapshot))?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        write_atomic(&self.path, &bytes)?;
        debug!(path = %self.path.display(), repos = snapshot.len(), "watch state saved");
        Ok(())
    }

    /// Empty when last-seen persistence is disabled or nothing was saved yet.
    pub fn load_last_seen(&self) -> Result<HashMap<RepositoryId, RevisionHash>> {
        if !self.persist_last_seen {
            return Ok(HashMap::new());
        }
        let path = self.seen_path();
        let Some(txt) = read_optional(&path)? else {
            return Ok(HashMap::new());
        };
        let root: Value = serde_json::from_str(&txt).map_err(|e| Error::Persistence {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let Value::Object(map) = root else {
            return Err(Error::Persistence {
                path,
                reason: "expected a JSON object".to_string(),
            });
        };

        let mut out = HashMap::new();
        for (key, value) in map {
            let (Ok(repo), Some(hash)) = (RepositoryId::parse(&key), value.as_str()) else {
                warn!(entry = %key, "skipping malformed last-seen entry");
                continue;
            };
            out.insert(repo, RevisionHash(hash.to_string()));
        }
        Ok(out)
    }

    /// No-op when last-seen persistence is disabled.
    pub fn save_last_seen(&self, seen: &[(RepositoryId, RevisionHash)]) -> Result<()> {
        if !self.persist_last_seen {
            return Ok(());
        }
        let mut map = Map::new();
        for (repo, hash) in seen {
            map.insert(repo.to_string(), Value::String(hash.0.clone()));
        }
        let bytes = serde_json::to_vec_pretty(&Value::Object(map))?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        write_atomic(&self.seen_path(), &bytes)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = fs::read_to_string(path).map_err(|e| Error::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(txt))
}

fn parse_snapshot(txt: &str) -> std::result::Result<WatchSnapshot, String> {
    let root: Value = serde_json::from_str(txt).map_err(|e| e.to_string())?;
    let Value::Object(map) = root else {
        return Err("expected a JSON object".to_string());
    };

    let mut entries: Vec<WatchEntry> = Vec::new();
    for (key, value) in map {
        let repo = match RepositoryId::parse(&key) {
            Ok(r) => r,
            Err(e) => {
                warn!(entry = %key, error = %e, "skipping watch entry with invalid repository");
                continue;
            }
        };
        match parse_destinations(&value) {
            Some(destinations) if !destinations.is_empty() => {
                entries.push(WatchEntry { repo, destinations })
            }
            _ => warn!(repo = %repo, "skipping watch entry with malformed destinations"),
        }
    }
    Ok(WatchSnapshot { entries })
}

/// Destinations are numbers; numeric strings are accepted as well.
fn parse_destinations(value: &Value) -> Option<Vec<DestinationId>> {
    let items = value.as_array()?;
    let mut out: Vec<DestinationId> = Vec::with_capacity(items.len());
    for item in items {
        let id = match item {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            _ => return None,
        };
        let id = DestinationId(id);
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Some(out)
}

fn render_snapshot(snapshot: &WatchSnapshot) -> Value {
    let mut map = Map::new();
    for entry in &snapshot.entries {
        let ids = entry
            .destinations
            .iter()
            .map(|d| Value::from(d.0))
            .collect::<Vec<_>>();
        map.insert(entry.repo.to_string(), Value::Array(ids));
    }
    Value::Object(map)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("state"));
    name.push(format!(".tmp.{}", std::process::id()));
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let persist_err = |e: std::io::Error| Error::Persistence {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf);
    if let Some(dir) = &parent {
        fs::create_dir_all(dir).map_err(persist_err)?;
    }

    let tmp = temp_path_for(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(persist_err)?;
        file.write_all(bytes).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(persist_err(e));
    }

    // The rename is only durable once the directory entry is synced.
    #[cfg(unix)]
    {
        let dir = parent.unwrap_or_else(|| PathBuf::from("."));
        File::open(&dir)
            .and_then(|d| d.sync_all())
            .map_err(persist_err)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tmp_dir(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        let dir = PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn repo(s: &str) -> RepositoryId {
        RepositoryId::parse(s).unwrap()
    }

    fn sample() -> WatchSnapshot {
        WatchSnapshot {
            entries: vec![
                WatchEntry {
                    repo: repo("zeta/last-registered-first"),
                    destinations: vec![DestinationId(-1001234), DestinationId(42)],
                },
                WatchEntry {
                    repo: repo("acme/widgets"),
                    destinations: vec![DestinationId(42)],
                },
            ],
        }
    }

    #[test]
    fn missing_and_empty_files_load_as_empty() {
        let dir = tmp_dir("cwb-store-empty");
        let store = WatchStore::new(dir.join("watches.json"), false);
        assert!(store.load().unwrap().is_empty());

        fs::write(store.path(), "  \n").unwrap();
        assert!(store.load().unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_then_load_round_trips_in_order() {
        let dir = tmp_dir("cwb-store-roundtrip");
        let store = WatchStore::new(dir.join("watches.json"), false);
        let snap = sample();

        store.save(&snap).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, snap);

        // Saving what was loaded reproduces the same file.
        let first = fs::read_to_string(store.path()).unwrap();
        store.save(&loaded).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), first);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_format_is_repo_to_id_list() {
        let dir = tmp_dir("cwb-store-format");
        let store = WatchStore::new(dir.join("watches.json"), false);
        store.save(&sample()).unwrap();

        let v: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "zeta/last-registered-first": [-1001234, 42],
                "acme/widgets": [42],
            })
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let dir = tmp_dir("cwb-store-malformed");
        let store = WatchStore::new(dir.join("watches.json"), false);
        fs::write(
            store.path(),
            r#"{
              "acme/widgets": [1, "2"],
              "not a repo": [3],
              "acme/gadgets": "oops",
              "acme/empty": [],
              "acme/mixed": [4, {"x": 1}],
              "acme/tools": [5]
            }"#,
        )
        .unwrap();

        let loaded = store.load().unwrap();
        let repos: Vec<String> = loaded.entries.iter().map(|e| e.repo.to_string()).collect();
        assert_eq!(repos, vec!["acme/widgets", "acme/tools"]);
        assert_eq!(
            loaded.entries[0].destinations,
            vec![DestinationId(1), DestinationId(2)]
        );
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn non_object_file_is_a_persistence_error() {
        let dir = tmp_dir("cwb-store-garbage");
        let store = WatchStore::new(dir.join("watches.json"), false);
        fs::write(store.path(), "[1, 2, 3]").unwrap();
        assert!(matches!(store.load(), Err(Error::Persistence { .. })));

        fs::write(store.path(), "{\"acme/widgets\": [1").unwrap();
        assert!(matches!(store.load(), Err(Error::Persistence { .. })));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn interrupted_save_leaves_previous_snapshot_readable() {
        let dir = tmp_dir("cwb-store-crash");
        let store = WatchStore::new(dir.join("watches.json"), false);
        let old = sample();
        store.save(&old).unwrap();

        // A crash between temp write and rename leaves a partial temp file behind.
        let tmp = temp_path_for(store.path());
        fs::write(&tmp, "{\"acme/widgets\": [4").unwrap();
        assert_eq!(store.load().unwrap(), old);

        // The next successful save replaces both the target and the stale temp file.
        let mut new = old.clone();
        new.entries[1].destinations.push(DestinationId(7));
        store.save(&new).unwrap();
        assert_eq!(store.load().unwrap(), new);
        assert!(!tmp.exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tmp_dir("cwb-store-parents");
        let store = WatchStore::new(dir.join("a/b/watches.json"), false);
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn last_seen_sidecar_only_when_enabled() {
        let dir = tmp_dir("cwb-store-seen");
        let seen = vec![(repo("acme/widgets"), RevisionHash("abc123".into()))];

        let off = WatchStore::new(dir.join("off.json"), false);
        off.save_last_seen(&seen).unwrap();
        assert!(!off.seen_path().exists());
        assert!(off.load_last_seen().unwrap().is_empty());

        let on = WatchStore::new(dir.join("on.json"), true);
        assert_eq!(on.seen_path(), dir.join("on.seen.json"));
        on.save_last_seen(&seen).unwrap();
        let loaded = on.load_last_seen().unwrap();
        assert_eq!(
            loaded.get(&repo("acme/widgets")),
            Some(&RevisionHash("abc123".into()))
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
