//! Link detection
//!
//! Finds the first short-form video link in a chat message.

use regex::Regex;

/// Hosts whose links get previews; matched anywhere inside a token
const LINK_PATTERN: &str = r"\S+(?:tiktok\.com|instagram\.com|twitter\.com|reddit\.com)\S+|https?://(?:www\.)?x\.com/\S+";

/// Compiled link matcher
#[derive(Debug, Clone)]
pub struct LinkDetector {
    pattern: Regex,
}

impl LinkDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(LINK_PATTERN)?,
        })
    }

    /// First matching link in `content`, if any. Later links are ignored.
    pub fn find<'a>(&self, content: &'a str) -> Option<&'a str> {
        self.pattern.find(content).map(|m| m.as_str())
    }
}
