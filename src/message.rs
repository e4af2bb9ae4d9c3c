//! Published messages
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::ChannelName;

/// Per-server sequence number, starts at 1
pub type MessageId = u64;

/// A message published to a concrete channel.
///
/// Serialized as the `{channel, data, id}` envelope returned by connects.
/// Each recipient gets its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: ChannelName,
    pub data: Value,
    pub id: MessageId,
}

impl Message {
    pub fn new(id: MessageId, channel: ChannelName, data: Value) -> Message {
        Message { channel, data, id }
    }
}
