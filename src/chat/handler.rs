//! Message Handler
//!
//! Turns a chat message into at most one published preview link.
//! Every failure is silent towards the channel; operators see log lines.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::links::LinkDetector;
use super::{MessageEvent, Publisher};
use crate::pipeline::Pipeline;

/// What handling a message led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Link found but no preview could be produced
    NoPreview,
    /// Preview resolved but the reply could not be sent
    NotSent,
    /// Preview link posted to the channel
    Published(String),
}

/// Shared message handling state
pub struct MessageHandler {
    pipeline: Arc<Pipeline>,
    publisher: Arc<dyn Publisher>,
    links: LinkDetector,
    base_url: String,
    bot_id: String,
}

impl MessageHandler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        publisher: Arc<dyn Publisher>,
        links: LinkDetector,
        base_url: String,
        bot_id: String,
    ) -> Self {
        Self {
            pipeline,
            publisher,
            links,
            base_url,
            bot_id,
        }
    }

    /// Link to preview in `event`, or `None` if the message should be ignored
    pub fn detect(&self, event: &MessageEvent) -> Option<String> {
        if event.author_id == self.bot_id {
            return None;
        }
        self.links.find(&event.content).map(str::to_string)
    }

    /// Resolve `link` and publish it as a reply to `event`
    pub async fn process(&self, event: &MessageEvent, link: &str) -> HandleOutcome {
        let Some(artifact) = self.pipeline.preview(link).await else {
            return HandleOutcome::NoPreview;
        };

        let public_url = artifact.public_url(&self.base_url);

        let sent = match self
            .publisher
            .send_message(&event.channel_id, &public_url)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %event.channel_id, error = %e, "Failed to send preview message");
                false
            }
        };

        if let Err(e) = self
            .publisher
            .suppress_embeds(&event.channel_id, &event.id)
            .await
        {
            debug!(message = %event.id, error = %e, "Failed to suppress embeds");
        }

        if !sent {
            return HandleOutcome::NotSent;
        }
        info!(link = link, artifact = artifact.name(), "Published preview");
        HandleOutcome::Published(public_url)
    }

    /// Pipeline used for resolution
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}
