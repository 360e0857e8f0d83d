//! Resolves destination names typed by users into chat ids.
//!
//! Lookup order: configured aliases, then chats the bot has seen (title or
//! username), then a literal numeric chat id. Names compare case-insensitively and
//! a leading `#` or `@` is ignored.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::domain::DestinationId;

#[derive(Default)]
pub struct DestinationDirectory {
    aliases: HashMap<String, DestinationId>,
    seen: Mutex<HashMap<String, DestinationId>>,
}

fn normalize(name: &str) -> String {
    name.trim()
        .trim_start_matches(['#', '@'])
        .to_lowercase()
}

impl DestinationDirectory {
    pub fn new(aliases: &[(String, i64)]) -> Self {
        Self {
            aliases: aliases
                .iter()
                .map(|(name, id)| (normalize(name), DestinationId(*id)))
                .collect(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Remember a chat by name. Later sightings of the same name win.
    pub async fn learn(&self, name: &str, id: DestinationId) {
        let key = normalize(name);
        if key.is_empty() {
            return;
        }
        self.seen.lock().await.insert(key, id);
    }

    pub async fn resolve(&self, name: &str) -> Option<DestinationId> {
        let key = normalize(name);
        if key.is_empty() {
            return None;
        }
        if let Some(id) = self.aliases.get(&key) {
            return Some(*id);
        }
        if let Some(id) = self.seen.lock().await.get(&key) {
            return Some(*id);
        }
        name.trim().parse::<i64>().ok().map(DestinationId)
    }
}
