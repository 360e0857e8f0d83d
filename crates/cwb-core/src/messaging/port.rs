use std::path::Path;

use async_trait::async_trait;

use crate::{domain::DestinationId, messaging::types::MessagingCapabilities, Result};

/// Cross-messenger delivery port.
///
/// Telegram is the first implementation; each call addresses a single destination
/// and may fail for that destination alone (chat deleted, bot removed, ...).
#[async_trait]
pub trait DeliveryPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, dest: DestinationId, html: &str) -> Result<()>;

    /// Send a file with an HTML caption. Only called when
    /// `capabilities().supports_attachments` is set.
    async fn send_attachment(&self, dest: DestinationId, path: &Path, caption_html: &str)
        -> Result<()>;
}
