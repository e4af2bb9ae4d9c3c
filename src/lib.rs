//! Long-polling publish/subscribe sessions, Bayeux style
//!
//! Clients open a session with a handshake, subscribe to channel patterns
//! (`/foo/bar`, `/foo/*`, `/foo/**`) and then repeatedly *connect*: a connect
//! is held open until a message for the session arrives or the long-poll
//! timeout elapses. Messages published while the client isn't connected are
//! kept in a bounded backlog and handed over on the next connect.
//!
//! # Embedding
//!
//! The [Dispatcher](dispatcher::Dispatcher) is the whole engine and doesn't
//! need the HTTP layer:
//!
//! ```rust
//! use bayeux_rs::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let dispatcher = Dispatcher::new(BayeuxConfig::default());
//! let client_id = dispatcher.handshake();
//! dispatcher.subscribe(&client_id, "/chat/**").unwrap();
//!
//! dispatcher.publish("/chat/room/1", json!({"text": "hi"})).unwrap();
//! let messages = dispatcher.connect(&client_id, "long-polling").await.unwrap();
//! assert_eq!(messages.len(), 1);
//! assert_eq!(messages[0].channel.as_str(), "/chat/room/1");
//! # }
//! ```
//!
//! # Running Server
//!
//! With the `http` feature (on by default) the engine is served as JSON over
//! HTTP, one `POST` route per operation:
//!
//! ```rust,no_run
//! use bayeux_rs::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut server = ServerBuilder::new()
//!     .address("0.0.0.0:8080".to_string())
//!     .config(BayeuxConfig::default())
//!     .build()
//!     .unwrap();
//! let listener = server.bind().await.unwrap();
//! server.run(listener).await.unwrap();
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::missing_crate_level_docs)]

pub mod channel;
pub mod channel_registry;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod long_poll;
pub mod message;
pub mod protocol;
pub mod session;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub mod server;

pub mod prelude {
    pub use super::channel::{ChannelName, ChannelPattern};
    pub use super::channel_registry::ChannelRegistry;
    pub use super::config::{BayeuxConfig, BayeuxConfigBuilder};
    pub use super::dispatcher::Dispatcher;
    pub use super::errors::{BayeuxError, CancelReason};
    pub use super::long_poll::{Delivery, LongPollHolder, PollState};
    pub use super::message::{Message, MessageId};
    pub use super::session::{Session, SessionId, SessionTable};

    #[cfg(feature = "http")]
    pub use super::server::{Server, ServerBuilder};
}
