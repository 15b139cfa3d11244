//! Discord REST Client
//!
//! Outbound side of the chat glue: identifies the bot, posts preview links
//! and suppresses the automatic embed on the message that carried the link.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::errors::PublishError;
use super::Publisher;

/// REST API base URL
const DISCORD_API_URL: &str = "https://discord.com/api/v10";

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Message flag that hides link embeds
pub const SUPPRESS_EMBEDS: u64 = 1 << 2;

/// The bot's own account
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub username: String,
}

/// Request body for creating a message
#[derive(Debug, Serialize)]
struct CreateMessage<'a> {
    content: &'a str,
}

/// Request body for editing message flags
#[derive(Debug, Serialize)]
struct EditFlags {
    flags: u64,
}

/// Authenticated Discord REST client
#[derive(Clone)]
pub struct DiscordClient {
    http_client: Client,
    auth_header: String,
    api_url: String,
}

impl DiscordClient {
    /// Create a client for a bot token
    pub fn new(token: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            auth_header: format!("Bot {}", token),
            api_url: DISCORD_API_URL.to_string(),
        })
    }

    /// Look up the bot's own user. Also validates the token.
    pub async fn current_user(&self) -> Result<CurrentUser, PublishError> {
        let url = format!("{}/users/@me", self.api_url);
        let response = self
            .http_client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;

        let user: CurrentUser = check(response).await?.json().await?;
        info!(user_id = %user.id, username = %user.username, "Connected to Discord");
        Ok(user)
    }
}

/// Turn a non-success response into a [`PublishError`]
async fn check(response: Response) -> Result<Response, PublishError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(PublishError::from_status(status, &body))
}

#[async_trait]
impl Publisher for DiscordClient {
    async fn send_message(&self, channel_id: &str, content: &str) -> Result<(), PublishError> {
        let url = format!("{}/channels/{}/messages", self.api_url, channel_id);
        let response = self
            .http_client
            .post(&url)
            .header("Authorization", &self.auth_header)
            .json(&CreateMessage { content })
            .send()
            .await?;

        check(response).await?;
        debug!(channel = channel_id, "Sent preview message");
        Ok(())
    }

    async fn suppress_embeds(&self, channel_id: &str, message_id: &str) -> Result<(), PublishError> {
        let url = format!(
            "{}/channels/{}/messages/{}",
            self.api_url, channel_id, message_id
        );
        let response = self
            .http_client
            .patch(&url)
            .header("Authorization", &self.auth_header)
            .json(&EditFlags {
                flags: SUPPRESS_EMBEDS,
            })
            .send()
            .await?;

        check(response).await?;
        debug!(channel = channel_id, message = message_id, "Suppressed embeds");
        Ok(())
    }
}
