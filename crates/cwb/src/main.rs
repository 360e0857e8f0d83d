use std::sync::Arc;

use cwb_core::{config::Config, source::RevisionSource};
use cwb_github::{GitHubClient, GitHubConfig};

#[tokio::main]
async fn main() -> Result<(), cwb_core::Error> {
    cwb_core::logging::init("cwb")?;

    let cfg = Arc::new(Config::load()?);

    let source: Arc<dyn RevisionSource> =
        Arc::new(GitHubClient::new(GitHubConfig::from_config(&cfg))?);

    cwb_telegram::router::run_polling(cfg, source)
        .await
        .map_err(|e| cwb_core::Error::External(format!("telegram bot failed: {e:#}")))?;

    Ok(())
}
