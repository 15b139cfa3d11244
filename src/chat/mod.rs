//! Chat platform glue
//!
//! Link detection on inbound messages and publishing preview links back.

pub mod discord;
pub mod errors;
pub mod handler;
pub mod links;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use discord::DiscordClient;
pub use errors::PublishError;
pub use handler::MessageHandler;
pub use links::LinkDetector;

/// A newly created chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Message ID
    pub id: String,
    /// Channel the message was posted in
    pub channel_id: String,
    /// Author's user ID
    pub author_id: String,
    /// Message text
    pub content: String,
}

/// Outbound chat operations
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Post `content` to a channel
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), PublishError>;

    /// Hide the automatic link embed on a message
    async fn suppress_embeds(&self, channel_id: &str, message_id: &str) -> Result<(), PublishError>;
}
