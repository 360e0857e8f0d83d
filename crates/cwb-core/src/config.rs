use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_message_limit: usize,
    /// `name=chat_id` pairs usable as destination names in commands.
    pub destination_aliases: Vec<(String, i64)>,

    // Revision API
    pub github_token: Option<String>,
    pub github_api_base: String,
    pub fetch_timeout: Duration,

    // Persistence
    pub state_file: PathBuf,
    pub persist_last_seen: bool,

    // Polling
    pub poll_interval: Duration,
    pub repo_throttle: Duration,

    // Notices
    pub notify_attachment: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let telegram_message_limit = env_usize("TELEGRAM_MESSAGE_LIMIT")
            .unwrap_or(4096)
            .max(64);
        let destination_aliases = parse_destination_aliases(env_str("DESTINATIONS"))?;

        let github_token = env_str("GITHUB_TOKEN").and_then(non_empty);
        let github_api_base = env_str("GITHUB_API_BASE")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string());
        let fetch_timeout = Duration::from_millis(env_u64("FETCH_TIMEOUT_MS").unwrap_or(10_000));

        let state_file =
            PathBuf::from(env_str("WATCH_STATE_FILE").unwrap_or("watches.json".to_string()));
        let persist_last_seen = env_bool("PERSIST_LAST_SEEN").unwrap_or(false);

        let poll_interval = Duration::from_secs(env_u64("POLL_INTERVAL_SECS").unwrap_or(60));
        let repo_throttle = Duration::from_millis(env_u64("REPO_THROTTLE_MS").unwrap_or(1000));

        let notify_attachment = env_path("NOTIFY_ATTACHMENT");
        if let Some(p) = &notify_attachment {
            if !p.is_file() {
                return Err(Error::Config(format!(
                    "NOTIFY_ATTACHMENT does not point to a file: {}",
                    p.display()
                )));
            }
        }

        Ok(Self {
            telegram_bot_token,
            telegram_message_limit,
            destination_aliases,
            github_token,
            github_api_base,
            fetch_timeout,
            state_file,
            persist_last_seen,
            poll_interval,
            repo_throttle,
            notify_attachment,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_str(key).and_then(non_empty).map(PathBuf::from)
}

/// `general=-1001234, ops=-1005678`
fn parse_destination_aliases(v: Option<String>) -> Result<Vec<(String, i64)>> {
    let mut out = Vec::new();
    for part in v.unwrap_or_default().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, id)) = part.split_once('=') else {
            return Err(Error::Config(format!(
                "DESTINATIONS entry must be name=chat_id: {part}"
            )));
        };
        let id = id.trim().parse::<i64>().map_err(|_| {
            Error::Config(format!("DESTINATIONS entry has a non-numeric chat id: {part}"))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config(format!(
                "DESTINATIONS entry has an empty name: {part}"
            )));
        }
        out.push((name.to_string(), id));
    }
    Ok(out)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
