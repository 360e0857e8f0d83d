//! Command gateway: turns chat commands into registry mutations and replies.
//!
//! Commands (prefix `/` or `!`, optional `@botname` suffix):
//! - `watch <owner/name> <destination>` (alias `latest_commit`)
//! - `list`
//! - `help` / `start`
//!
//! A registration is accepted only after the repository's latest revision could be
//! fetched. It is then saved right away, and the fetched revision is announced to
//! the newly registered destination.

use std::sync::Arc;

use tracing::{error, info};

use crate::{
    directory::DestinationDirectory,
    dispatcher::NotifyReport,
    domain::{DestinationId, RepositoryId, RevisionInfo},
    formatting::{escape_html, watch_list_html},
    poller::Poller,
    registry::AddOutcome,
    source::FetchError,
};

pub const USAGE: &str = "Usage: /watch &lt;owner/repository&gt; &lt;destination&gt;\n\
/list shows every watched repository.";

/// Split `/cmd@bot rest of line` into (`cmd`, `rest of line`).
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    if !text.starts_with('/') && !text.starts_with('!') {
        return None;
    }

    let mut parts = text.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches(['/', '!'])
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if cmd.is_empty() {
        return None;
    }

    Some((cmd, rest))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Not exactly two arguments.
    Usage,
    InvalidRepo {
        raw: String,
    },
    DestinationNotFound {
        name: String,
    },
    /// The revision API does not know the repository (or will not show it).
    RepositoryNotFound {
        repo: RepositoryId,
        status: u16,
    },
    /// The repository could not be checked right now; nothing was registered.
    Unverified {
        repo: RepositoryId,
        error: FetchError,
    },
    AlreadyTracked {
        repo: RepositoryId,
        name: String,
    },
    Added {
        repo: RepositoryId,
        dest: DestinationId,
        name: String,
        revision: RevisionInfo,
    },
}

impl RegisterOutcome {
    pub fn reply_html(&self) -> String {
        match self {
            RegisterOutcome::Usage => format!("Invalid number of arguments. {USAGE}"),
            RegisterOutcome::InvalidRepo { raw } => format!(
                "Invalid repository name: {}. Please check the repository name or access it directly at: {}",
                escape_html(raw),
                escape_html(&RepositoryId::web_url(raw))
            ),
            RegisterOutcome::DestinationNotFound { name } => {
                format!("Destination {} not found", escape_html(name))
            }
            RegisterOutcome::RepositoryNotFound { repo, status } => format!(
                "Repository {} could not be found (HTTP {status}). Please check the repository name or access it directly at: {}",
                escape_html(repo.as_str()),
                escape_html(&RepositoryId::web_url(repo.as_str()))
            ),
            RegisterOutcome::Unverified { repo, error } => format!(
                "Could not check {} right now ({}). Nothing was scheduled, please try again later.",
                escape_html(repo.as_str()),
                escape_html(&error.to_string())
            ),
            RegisterOutcome::AlreadyTracked { repo, name } => format!(
                "{} is already tracked for {}",
                escape_html(repo.as_str()),
                escape_html(name)
            ),
            RegisterOutcome::Added { repo, name, .. } => format!(
                "Successfully scheduled commit information for {} to be sent to {} when there are new commits",
                escape_html(repo.as_str()),
                escape_html(name)
            ),
        }
    }
}

/// Out-of-cycle check to run after the reply has been sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowUp {
    pub repo: RepositoryId,
    pub dest: DestinationId,
    pub revision: RevisionInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandReply {
    pub html: String,
    pub follow_up: Option<FollowUp>,
}

impl CommandReply {
    fn text(html: String) -> Self {
        Self {
            html,
            follow_up: None,
        }
    }
}

pub struct CommandGateway {
    poller: Poller,
    directory: Arc<DestinationDirectory>,
}

impl CommandGateway {
    pub fn new(poller: Poller, directory: Arc<DestinationDirectory>) -> Self {
        Self { poller, directory }
    }

    pub fn directory(&self) -> &Arc<DestinationDirectory> {
        &self.directory
    }

    /// `None` when `text` is not a command this bot knows.
    pub async fn handle(&self, text: &str) -> Option<CommandReply> {
        let (cmd, args) = parse_command(text)?;
        match cmd.as_str() {
            "watch" | "latest_commit" => {
                let outcome = self.register(&args).await;
                let follow_up = match &outcome {
                    RegisterOutcome::Added {
                        repo,
                        dest,
                        revision,
                        ..
                    } => Some(FollowUp {
                        repo: repo.clone(),
                        dest: *dest,
                        revision: revision.clone(),
                    }),
                    _ => None,
                };
                Some(CommandReply {
                    html: outcome.reply_html(),
                    follow_up,
                })
            }
            "list" => Some(CommandReply::text(self.list_html().await)),
            "help" | "start" => Some(CommandReply::text(USAGE.to_string())),
            _ => None,
        }
    }

    /// Validate, resolve, fetch, register, save. Nothing is mutated unless every
    /// check before `add_watch` passed.
    pub async fn register(&self, args: &str) -> RegisterOutcome {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let [raw_repo, name] = parts.as_slice() else {
            return RegisterOutcome::Usage;
        };

        let Ok(repo) = RepositoryId::parse(raw_repo) else {
            return RegisterOutcome::InvalidRepo {
                raw: raw_repo.to_string(),
            };
        };

        let Some(dest) = self.directory.resolve(name).await else {
            return RegisterOutcome::DestinationNotFound {
                name: name.to_string(),
            };
        };

        let revision = match self.poller.fetch_now(&repo).await {
            Ok(revision) => revision,
            Err(FetchError::NotFound { status }) => {
                return RegisterOutcome::RepositoryNotFound { repo, status }
            }
            Err(error) => return RegisterOutcome::Unverified { repo, error },
        };

        match self.poller.registry().add_watch(repo.clone(), dest).await {
            AddOutcome::Added => {}
            AddOutcome::AlreadyTracked | AddOutcome::InvalidRepo => {
                return RegisterOutcome::AlreadyTracked {
                    repo,
                    name: name.to_string(),
                }
            }
        }

        info!(repo = %repo, destination = %dest, "watch registered");
        if let Err(e) = self.poller.save_now().await {
            // The poll loop saves again at the end of its next cycle.
            error!(repo = %repo, error = %e, "failed to persist new watch");
        }

        RegisterOutcome::Added {
            repo,
            dest,
            name: name.to_string(),
            revision,
        }
    }

    pub async fn run_follow_up(&self, follow_up: &FollowUp) -> NotifyReport {
        self.poller
            .announce(&follow_up.repo, follow_up.dest, &follow_up.revision)
            .await
    }

    pub async fn list_html(&self) -> String {
        watch_list_html(&self.poller.registry().list_watches().await)
    }
}
