//! Publish Error Types
//!
//! Failures talking to the chat platform's REST API. Publishing is
//! best-effort: these are logged, never surfaced to the channel.

/// Chat platform API error
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Bot token rejected")]
    Unauthorized,

    #[error("Missing permission: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl PublishError {
    /// Map an unsuccessful HTTP status and body to an error
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => PublishError::Unauthorized,
            403 => PublishError::Forbidden(body.to_string()),
            404 => PublishError::NotFound(body.to_string()),
            429 => PublishError::RateLimited,
            500..=599 => PublishError::Server(status, body.to_string()),
            _ => PublishError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(PublishError::from_status(401, ""), PublishError::Unauthorized));
        assert!(matches!(PublishError::from_status(429, ""), PublishError::RateLimited));
        assert!(matches!(
            PublishError::from_status(404, "Unknown Message"),
            PublishError::NotFound(body) if body == "Unknown Message"
        ));
        assert!(matches!(PublishError::from_status(502, "bad gateway"), PublishError::Server(502, _)));
        assert_eq!(
            PublishError::from_status(400, "nope").to_string(),
            "Request error: HTTP 400: nope"
        );
    }
}
