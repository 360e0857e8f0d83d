/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_attachments: bool,
    pub max_message_len: usize,
    /// Captions are usually much shorter than messages.
    pub max_caption_len: usize,
}

impl Default for MessagingCapabilities {
    fn default() -> Self {
        Self {
            supports_attachments: false,
            max_message_len: 4096,
            max_caption_len: 1024,
        }
    }
}
