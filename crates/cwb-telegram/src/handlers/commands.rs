use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, warn};

use cwb_core::domain::DestinationId;

use crate::router::AppState;

pub async fn handle_command(
    text: &str,
    chat: DestinationId,
    state: &Arc<AppState>,
) -> ResponseResult<()> {
    // Unknown commands and plain chatter are ignored (group chats are noisy).
    let Some(reply) = state.gateway.handle(text).await else {
        return Ok(());
    };

    if let Err(e) = state.messenger.send_html(chat, &reply.html).await {
        warn!(chat = %chat, error = %e, "failed to send command reply");
    }

    if let Some(follow_up) = reply.follow_up {
        let report = state.gateway.run_follow_up(&follow_up).await;
        debug!(
            repo = %follow_up.repo,
            destination = %follow_up.dest,
            delivered = report.delivered,
            failed = report.failed,
            "revision announced after registration"
        );
    }

    Ok(())
}
