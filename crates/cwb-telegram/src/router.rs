use std::sync::Arc;

use anyhow::Context;
use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cwb_core::{
    config::Config,
    directory::DestinationDirectory,
    dispatcher::NotificationDispatcher,
    gateway::CommandGateway,
    messaging::{
        port::DeliveryPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    poller::{PollConfig, Poller},
    registry::WatchRegistry,
    source::RevisionSource,
    store::WatchStore,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub messenger: Arc<dyn DeliveryPort>,
    pub gateway: Arc<CommandGateway>,
}

/// Load state, start the poll loop, and serve commands until Ctrl-C.
pub async fn run_polling(cfg: Arc<Config>, source: Arc<dyn RevisionSource>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    // The poll loop only starts once the bot session is known to work.
    let me = bot.get_me().await.context("telegram getMe failed")?;
    info!(username = %me.username(), "cwb started");

    let store = Arc::new(WatchStore::new(
        cfg.state_file.clone(),
        cfg.persist_last_seen,
    ));
    let snapshot = store
        .load()
        .with_context(|| format!("failed to load {}", cfg.state_file.display()))?;
    let last_seen = match store.load_last_seen() {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable last-seen state");
            Default::default()
        }
    };
    info!(
        path = %cfg.state_file.display(),
        repos = snapshot.len(),
        persist_last_seen = cfg.persist_last_seen,
        "watch state loaded"
    );
    let registry = Arc::new(WatchRegistry::from_snapshot(snapshot, last_seen));

    // Throttle on top of the adapter's own RetryAfter retry: a fan-out to many chats
    // would otherwise hit Telegram's flood limits.
    let raw_messenger: Arc<dyn DeliveryPort> = Arc::new(TelegramMessenger::new(
        bot.clone(),
        cfg.telegram_message_limit,
    ));
    let messenger: Arc<dyn DeliveryPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let dispatcher = Arc::new(
        NotificationDispatcher::new(registry.clone(), messenger.clone())
            .with_attachment(cfg.notify_attachment.clone()),
    );
    let poller = Poller::new(
        PollConfig::from_config(&cfg),
        registry,
        source,
        dispatcher,
        store,
    );
    let directory = Arc::new(DestinationDirectory::new(&cfg.destination_aliases));
    let gateway = Arc::new(CommandGateway::new(poller.clone(), directory));

    let cancel = CancellationToken::new();
    let poll_task = {
        let poller = poller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { poller.supervise(cancel).await })
    };

    let state = Arc::new(AppState {
        messenger,
        gateway,
    });

    // Exactly one endpoint: every incoming message is handled once.
    let handler = Update::filter_message().endpoint(handlers::handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("shutting down");
    cancel.cancel();
    if let Err(e) = poll_task.await {
        warn!(error = %e, "poll task ended abnormally");
    }
    if let Err(e) = poller.save_now().await {
        error!(error = %e, "final save of watch state failed");
    }

    Ok(())
}
