//! Channel access: message type and the client seam.

pub mod telegram;

pub use telegram::TelegramGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// One channel message, immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Channel-native id, monotonically increasing within the channel.
    pub id: i64,
    /// When the message was posted.
    pub date: DateTime<Utc>,
    /// Raw message text.
    pub text: String,
    /// Channel username the message came from.
    pub channel: String,
}

/// Client for one messaging backend.
///
/// Both calls return messages newest-first. `offset_id` pages through
/// history: when set, only messages with a smaller (older) id are returned.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Server-side phrase search. May fail with
    /// [`ChannelError::SearchUnsupported`] on backends that restrict search.
    async fn search_messages(
        &self,
        channel: &str,
        phrase: &str,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, ChannelError>;

    /// Reverse-chronological walk over all channel messages.
    async fn iter_messages(
        &self,
        channel: &str,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serde_round_trip() {
        let msg = Message {
            id: 17,
            date: Utc::now(),
            text: "У ніч на 5 серпня".into(),
            channel: "kpszsu".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 17);
        assert_eq!(back.text, msg.text);
    }
}
