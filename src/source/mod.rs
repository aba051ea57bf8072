//! Chat source abstraction.
//!
//! A chat source turns a platform URL into a lazy stream of chat messages.
//! Retrieval itself (platform protocols, auth, pagination) lives behind this
//! trait; the job runner only pulls from the stream.

pub mod memory;
pub mod remote;

pub use memory::{ChannelSource, MemorySource};
pub use remote::RemoteChatSource;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Platform domains accepted for download (substring match on the lowercased URL).
pub const SUPPORTED_PLATFORMS: [&str; 4] = ["twitch.tv", "youtube.com", "facebook.com", "zoom.us"];

/// Check a URL against the supported-platform allow-list.
pub fn is_supported_url(url: &str) -> bool {
    let url = url.to_lowercase();
    SUPPORTED_PLATFORMS.iter().any(|p| url.contains(p))
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub message: String,
    /// Platform-specific fields passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message_id: None,
            timestamp: Utc::now(),
            author: author.into(),
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Parameters handed to a chat source when a job starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub url: String,
    /// Upper bound on messages; `None` means unbounded.
    pub max_messages: Option<u64>,
    /// Time budget the source is expected to honour.
    pub timeout: Duration,
}

/// Lazy, possibly unbounded sequence of messages.
pub type MessageStream = BoxStream<'static, Result<ChatMessage, SourceError>>;

/// Capability that yields chat messages for a platform URL.
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Contact the platform and return the message stream.
    ///
    /// Returning `Ok` counts as first successful contact.
    async fn open(&self, request: &ChatRequest) -> Result<MessageStream, SourceError>;
}
