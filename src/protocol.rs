//! Client/Server communication protocol
//!
//! JSON envelopes for the Bayeux-style endpoints. Field names follow the
//! Bayeux convention (`clientId`, `connectionType`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BayeuxError;
use crate::message::MessageId;
use crate::session::SessionId;

pub const BAYEUX_VERSION: &str = "1.0";
pub const LONG_POLLING: &str = "long-polling";
pub const SUPPORTED_CONNECTION_TYPES: &[&str] = &[LONG_POLLING];

/// How the client should reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Connect again with the same `clientId`
    Retry,
    /// The session is gone, handshake again
    Handshake,
    /// Don't reconnect
    None,
}

/// Server hint attached to handshakes and failed requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    pub reconnect: Reconnect,
    /// Milliseconds to wait before reconnecting
    pub interval: u64,
    /// Milliseconds the server holds a connect
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout: Option<u64>,
}

impl Advice {
    pub fn retry(long_poll_timeout_millis: u64) -> Advice {
        Advice {
            reconnect: Reconnect::Retry,
            interval: 0,
            timeout: Some(long_poll_timeout_millis),
        }
    }

    /// Advice for clients whose request failed with `error`
    pub fn for_error(error: &BayeuxError) -> Option<Advice> {
        let reconnect = match error {
            BayeuxError::UnknownSession | BayeuxError::SessionExpired => Reconnect::Handshake,
            BayeuxError::Disconnected => Reconnect::None,
            _ => return None,
        };
        Some(Advice {
            reconnect,
            interval: 0,
            timeout: None,
        })
    }
}

/// `POST /handshake` answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub successful: bool,
    pub client_id: SessionId,
    pub supported_connection_types: Vec<String>,
    pub version: String,
    pub advice: Advice,
}

impl HandshakeResponse {
    pub fn new(client_id: SessionId, long_poll_timeout_millis: u64) -> HandshakeResponse {
        HandshakeResponse {
            successful: true,
            client_id,
            supported_connection_types: SUPPORTED_CONNECTION_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            version: BAYEUX_VERSION.to_string(),
            advice: Advice::retry(long_poll_timeout_millis),
        }
    }
}

fn default_connection_type() -> String {
    LONG_POLLING.to_string()
}

/// `POST /connect` body. The answer is a list of
/// [Message](crate::message::Message)s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub client_id: SessionId,
    #[serde(default = "default_connection_type")]
    pub connection_type: String,
}

/// `POST /subscribe` and `POST /unsubscribe` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub client_id: SessionId,
    pub subscription: String,
}

/// `POST /publish` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub client_id: SessionId,
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

/// `POST /disconnect` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub client_id: SessionId,
}

/// Plain success answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub successful: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub subscription: Option<String>,
}

impl Ack {
    pub fn ok() -> Ack {
        Ack {
            successful: true,
            subscription: None,
        }
    }

    pub fn subscription(subscription: impl Into<String>) -> Ack {
        Ack {
            successful: true,
            subscription: Some(subscription.into()),
        }
    }
}

/// `POST /publish` answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub successful: bool,
    pub id: MessageId,
}

/// Failure answer for every endpoint: `{successful: false, error}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub successful: bool,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub advice: Option<Advice>,
}

impl From<BayeuxError> for ErrorResponse {
    fn from(error: BayeuxError) -> Self {
        ErrorResponse {
            successful: false,
            error: error.code().to_string(),
            message: error.to_string(),
            advice: Advice::for_error(&error),
        }
    }
}
