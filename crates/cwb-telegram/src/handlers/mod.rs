//! Telegram update handlers.
//!
//! Every message teaches the destination directory the chat's name, so users can
//! refer to a chat by title in `/watch`. Commands are then handed to the core
//! command gateway.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use cwb_core::{directory::DestinationDirectory, domain::DestinationId};

use crate::router::AppState;

mod commands;

/// What an incoming message means for the bot.
#[derive(Debug, PartialEq, Eq)]
struct Inbound<'a> {
    /// Names the chat can be addressed by.
    names: Vec<&'a str>,
    /// Text to hand to the command gateway.
    text: Option<&'a str>,
}

/// `None` for messages from other bots, which are ignored entirely.
fn classify<'a>(
    from_bot: bool,
    title: Option<&'a str>,
    username: Option<&'a str>,
    text: Option<&'a str>,
) -> Option<Inbound<'a>> {
    if from_bot {
        return None;
    }
    let names = [title, username]
        .into_iter()
        .flatten()
        .filter(|n| !n.trim().is_empty())
        .collect();
    Some(Inbound { names, text })
}

async fn learn_names(directory: &DestinationDirectory, names: &[&str], dest: DestinationId) {
    for name in names {
        directory.learn(name, dest).await;
    }
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(inbound) = classify(
        msg.from().map(|u| u.is_bot).unwrap_or(false),
        msg.chat.title(),
        msg.chat.username(),
        msg.text(),
    ) else {
        return Ok(());
    };

    let chat = DestinationId(msg.chat.id.0);
    learn_names(state.gateway.directory(), &inbound.names, chat).await;

    match inbound.text {
        Some(text) => commands::handle_command(text, chat, &state).await,
        None => Ok(()),
    }
}
