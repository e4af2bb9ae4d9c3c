//! Protocol entry points and message fan-out
//!
//! The [Dispatcher] glues the [SessionTable], the
//! [ChannelRegistry](crate::channel_registry::ChannelRegistry) and the
//! [LongPollHolder] together. The HTTP layer only talks to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelName, ChannelPattern};
use crate::channel_registry::ChannelRegistry;
use crate::config::BayeuxConfig;
use crate::errors::{BayeuxError, CancelReason};
use crate::long_poll::{Delivery, LongPollHolder};
use crate::message::{Message, MessageId};
use crate::protocol::SUPPORTED_CONNECTION_TYPES;
use crate::session::{SessionId, SessionTable};

/// Session engine shared by every request handler
///
/// # Example
/// ```rust
/// # use bayeux_rs::dispatcher::Dispatcher;
/// # use bayeux_rs::config::BayeuxConfig;
/// # use serde_json::json;
/// # #[tokio::main]
/// # async fn main() {
/// let dispatcher = Dispatcher::new(BayeuxConfig::default());
/// let client_id = dispatcher.handshake();
/// dispatcher.subscribe(&client_id, "/foo/*").unwrap();
///
/// let id = dispatcher.publish("/foo/bar", json!("X")).unwrap();
/// let messages = dispatcher.connect(&client_id, "long-polling").await.unwrap();
/// assert_eq!(messages[0].id, id);
/// # }
/// ```
#[derive(Debug)]
pub struct Dispatcher {
    config: BayeuxConfig,
    sessions: SessionTable,
    holder: LongPollHolder,
    /// Last assigned message id. Held while a message is fanned out so every
    /// session sees ids in ascending order. Publishes therefore fan out one at
    /// a time: parallel fan-out is traded for per-session id order. Resolving
    /// recipients happens before the lock is taken.
    sequence: Mutex<MessageId>,
}

impl Dispatcher {
    pub fn new(config: BayeuxConfig) -> Dispatcher {
        let registry = Arc::new(ChannelRegistry::new());
        Dispatcher {
            sessions: SessionTable::new(registry, config.session_timeout),
            holder: LongPollHolder::new(config.backlog_capacity),
            sequence: Mutex::new(0),
            config,
        }
    }

    pub fn config(&self) -> &BayeuxConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn registry(&self) -> &ChannelRegistry {
        self.sessions.registry()
    }

    pub fn holder(&self) -> &LongPollHolder {
        &self.holder
    }

    /// Opens a new session
    pub fn handshake(&self) -> SessionId {
        let id = self.sessions.create();
        self.holder.register(&id);
        debug!(session_id:% = id; "handshake");
        id
    }

    /// Subscribes the session to `pattern`. `/meta/...` channels can't be
    /// subscribed to.
    pub fn subscribe(&self, id: &SessionId, pattern: &str) -> Result<ChannelPattern, BayeuxError> {
        let pattern = ChannelPattern::parse(pattern)?;
        if pattern.touches_meta() {
            return Err(BayeuxError::InvalidPattern(pattern.into()));
        }
        self.sessions.subscribe(id, &pattern)?;
        Ok(pattern)
    }

    pub fn unsubscribe(
        &self,
        id: &SessionId,
        pattern: &str,
    ) -> Result<ChannelPattern, BayeuxError> {
        let pattern = ChannelPattern::parse(pattern)?;
        self.sessions.unsubscribe(id, &pattern)?;
        Ok(pattern)
    }

    /// Long-poll connect
    ///
    /// Returns the session's pending messages, waiting up to the configured
    /// long-poll timeout for some to arrive. An empty batch means the timeout
    /// elapsed and the client should connect again.
    pub async fn connect(
        &self,
        id: &SessionId,
        connection_type: &str,
    ) -> Result<Vec<Message>, BayeuxError> {
        if !SUPPORTED_CONNECTION_TYPES.contains(&connection_type) {
            return Err(BayeuxError::UnsupportedConnectionType(
                connection_type.to_string(),
            ));
        }
        self.sessions.touch(id)?;
        if self.sessions.mark_connected(id)? {
            info!(session_id:% = id; "session connected");
        }

        let deadline = Instant::now() + self.config.long_poll_timeout;
        let result = self.holder.park(id, deadline).await;

        // The time spent parked counts as activity
        if !matches!(
            result,
            Err(BayeuxError::SessionExpired | BayeuxError::Disconnected)
        ) {
            self.sessions.touch(id).ok();
        }
        result
    }

    fn publishable(channel: &str) -> Result<ChannelName, BayeuxError> {
        let channel = ChannelName::parse(channel)?;
        if channel.is_meta() {
            return Err(BayeuxError::InvalidChannel(channel.into()));
        }
        Ok(channel)
    }

    /// Publishes `data` to a concrete channel and returns the message id.
    /// Publishing to a channel nobody listens to is fine.
    pub fn publish(&self, channel: &str, data: Value) -> Result<MessageId, BayeuxError> {
        let channel = Self::publishable(channel)?;
        let recipients = self.registry().resolve(&channel);

        let mut orphaned = vec![];
        let id = {
            let mut sequence = self.sequence.lock();
            *sequence += 1;
            let message = Message::new(*sequence, channel, data);
            for session in recipients {
                if self.holder.deliver(&session, vec![message.clone()]) == Delivery::Orphaned {
                    orphaned.push(session);
                }
            }
            message.id
        };
        self.abort_sessions(orphaned);
        Ok(id)
    }

    /// Publishes on behalf of a session
    pub fn publish_from(
        &self,
        id: &SessionId,
        channel: &str,
        data: Value,
    ) -> Result<MessageId, BayeuxError> {
        self.sessions.touch(id)?;
        self.publish(channel, data)
    }

    /// Publishes several messages at once
    ///
    /// Ids are assigned in the given order. Each session gets everything meant
    /// for it in a single delivery, in ascending id order. Nothing is
    /// published if any channel is invalid.
    pub fn publish_batch(
        &self,
        items: Vec<(String, Value)>,
    ) -> Result<Vec<MessageId>, BayeuxError> {
        let resolved = items
            .into_iter()
            .map(|(channel, data)| {
                let channel = Self::publishable(&channel)?;
                let recipients = self.registry().resolve(&channel);
                Ok((channel, data, recipients))
            })
            .collect::<Result<Vec<_>, BayeuxError>>()?;

        let mut ids = Vec::with_capacity(resolved.len());
        let mut orphaned = vec![];
        {
            let mut sequence = self.sequence.lock();
            let mut batches: HashMap<SessionId, Vec<Message>> = HashMap::new();
            for (channel, data, recipients) in resolved {
                *sequence += 1;
                let message = Message::new(*sequence, channel, data);
                for session in recipients {
                    batches.entry(session).or_default().push(message.clone());
                }
                ids.push(message.id);
            }
            for (session, messages) in batches {
                if self.holder.deliver(&session, messages) == Delivery::Orphaned {
                    orphaned.push(session);
                }
            }
        }
        self.abort_sessions(orphaned);
        Ok(ids)
    }

    /// Closes the session. Its parked connect, if any, is answered with
    /// [BayeuxError::Disconnected].
    pub fn disconnect(&self, id: &SessionId) -> Result<(), BayeuxError> {
        let existed = self.sessions.destroy(id);
        self.holder.cancel(id, CancelReason::Disconnected);
        if existed {
            debug!(session_id:% = id; "disconnected");
            Ok(())
        } else {
            Err(BayeuxError::UnknownSession)
        }
    }

    /// Disconnects every session, answering parked connects right away.
    /// Used on shutdown.
    pub fn disconnect_all(&self) -> usize {
        let ids = self.sessions.ids();
        let count = ids.len();
        for id in ids {
            self.sessions.destroy(&id);
            self.holder.cancel(&id, CancelReason::Disconnected);
        }
        if count > 0 {
            info!(sessions = count; "disconnected all sessions");
        }
        count
    }

    /// Drops sessions whose parked connect went missing
    fn abort_sessions(&self, sessions: Vec<SessionId>) {
        for id in sessions {
            error!(session_id:% = id; "aborting session after a broken long-poll handoff");
            self.sessions.destroy(&id);
            self.holder.cancel(&id, CancelReason::SessionExpired);
        }
    }

    /// Expires inactive sessions, releasing their parked connects with
    /// [BayeuxError::SessionExpired]
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let expired = self.sessions.sweep(now);
        for id in expired.iter() {
            self.holder.cancel(id, CancelReason::SessionExpired);
        }
        let pruned = self.registry().compact();
        if pruned > 0 {
            debug!(pruned = pruned; "channel registry compacted");
        }
        expired
    }

    /// Runs [Dispatcher::sweep] every `sweep_interval` until `shutdown` fires
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        // A zero period panics in tokio; hand-built configs may skip validation
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep(Utc::now());
                }
            }
        }
        debug!("sweeper stopped");
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::config::BayeuxConfigBuilder;
    use crate::long_poll::PollState;

    fn dispatcher(long_poll_millis: u64) -> Arc<Dispatcher> {
        let config = BayeuxConfigBuilder::default()
            .long_poll_timeout(Duration::from_millis(long_poll_millis))
            .build()
            .unwrap();
        Arc::new(Dispatcher::new(config))
    }

    async fn wait_for_waiting(dispatcher: &Dispatcher, id: &SessionId) {
        while !matches!(dispatcher.holder().state(id), Some(PollState::Waiting { .. })) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn_connect(
        dispatcher: &Arc<Dispatcher>,
        id: &SessionId,
    ) -> tokio::task::JoinHandle<Result<Vec<Message>, BayeuxError>> {
        let dispatcher = dispatcher.clone();
        let id = id.clone();
        tokio::spawn(async move { dispatcher.connect(&id, "long-polling").await })
    }

    #[tokio::test]
    async fn publish_reaches_parked_connect() {
        let dispatcher = dispatcher(5_000);
        let id = dispatcher.handshake();
        dispatcher.subscribe(&id, "/foo/*").unwrap();

        let connect = spawn_connect(&dispatcher, &id);
        wait_for_waiting(&dispatcher, &id).await;

        let message_id = dispatcher.publish("/foo/bar", json!("X")).unwrap();
        assert_eq!(message_id, 1);

        let messages = connect.await.unwrap().unwrap();
        assert_eq!(
            messages,
            vec![Message::new(
                1,
                ChannelName::parse("/foo/bar").unwrap(),
                json!("X")
            )]
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers() {
        let dispatcher = dispatcher(100);
        assert_eq!(dispatcher.publish("/nobody/home", json!(1)), Ok(1));
        assert_eq!(dispatcher.publish("/nobody/home", json!(2)), Ok(2));
    }

    #[tokio::test]
    async fn publish_rejects_patterns_and_meta() {
        let dispatcher = dispatcher(100);
        assert_eq!(
            dispatcher.publish("/foo/*", json!(1)),
            Err(BayeuxError::InvalidChannel("/foo/*".to_string()))
        );
        assert!(dispatcher.publish("/foo/**", json!(1)).is_err());
        assert_eq!(
            dispatcher.publish("/meta/connect", json!(1)),
            Err(BayeuxError::InvalidChannel("/meta/connect".to_string()))
        );
        // Rejected publishes don't consume ids
        assert_eq!(dispatcher.publish("/foo", json!(1)), Ok(1));
    }

    #[tokio::test]
    async fn subscribe_errors() {
        let dispatcher = dispatcher(100);
        let id = dispatcher.handshake();
        assert_eq!(
            dispatcher.subscribe(&SessionId::from("nope"), "/foo"),
            Err(BayeuxError::UnknownSession)
        );
        assert_eq!(
            dispatcher.subscribe(&id, "/foo/**/bar"),
            Err(BayeuxError::InvalidPattern("/foo/**/bar".to_string()))
        );
        assert!(dispatcher.subscribe(&id, "/meta/connect").is_err());
        assert!(dispatcher.subscribe(&id, "/*").is_ok());
    }

    #[tokio::test]
    async fn root_deep_wildcard_receives_everything() {
        let dispatcher = dispatcher(5_000);
        let id = dispatcher.handshake();
        assert_eq!(
            dispatcher.subscribe(&id, "/**").map(String::from),
            Ok("/**".to_string())
        );
        dispatcher.publish("/foo/bar", json!(1)).unwrap();
        dispatcher.publish("/top", json!(2)).unwrap();
        assert_eq!(dispatcher.holder().backlog_len(&id), Some(2));

        let messages = dispatcher.connect(&id, "long-polling").await.unwrap();
        let channels: Vec<&str> = messages.iter().map(|m| m.channel.as_str()).collect();
        assert_eq!(channels, vec!["/foo/bar", "/top"]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let dispatcher = dispatcher(100);
        let id = dispatcher.handshake();
        dispatcher.subscribe(&id, "/foo").unwrap();
        dispatcher.unsubscribe(&id, "/foo").unwrap();
        dispatcher.unsubscribe(&id, "/foo").unwrap();
        dispatcher.publish("/foo", json!(1)).unwrap();
        assert_eq!(dispatcher.holder().backlog_len(&id), Some(0));
    }

    #[tokio::test]
    async fn idle_session_gets_backlog_on_next_connect() {
        let dispatcher = dispatcher(5_000);
        let id = dispatcher.handshake();
        dispatcher.subscribe(&id, "/foo").unwrap();
        dispatcher.publish("/foo", json!("a")).unwrap();
        dispatcher.publish("/foo", json!("b")).unwrap();

        let started = Instant::now();
        let messages = dispatcher.connect(&id, "long-polling").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn connect_times_out_empty() {
        let dispatcher = dispatcher(100);
        let id = dispatcher.handshake();
        let messages = dispatcher.connect(&id, "long-polling").await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(dispatcher.holder().state(&id), Some(PollState::Idle));
        assert!(dispatcher.sessions().get(&id).unwrap().connected());
    }

    #[tokio::test]
    async fn connect_errors() {
        let dispatcher = dispatcher(100);
        let id = dispatcher.handshake();
        assert_eq!(
            dispatcher.connect(&id, "websocket").await,
            Err(BayeuxError::UnsupportedConnectionType("websocket".to_string()))
        );
        assert_eq!(
            dispatcher
                .connect(&SessionId::from("nope"), "long-polling")
                .await,
            Err(BayeuxError::UnknownSession)
        );
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let dispatcher = dispatcher(5_000);
        let id = dispatcher.handshake();
        let first = spawn_connect(&dispatcher, &id);
        wait_for_waiting(&dispatcher, &id).await;

        assert_eq!(
            dispatcher.connect(&id, "long-polling").await,
            Err(BayeuxError::AlreadyWaiting)
        );
        dispatcher.disconnect(&id).unwrap();
        assert_eq!(first.await.unwrap(), Err(BayeuxError::Disconnected));
    }

    #[tokio::test]
    async fn disconnect_cleans_up() {
        let dispatcher = dispatcher(100);
        let id = dispatcher.handshake();
        dispatcher.subscribe(&id, "/foo/**").unwrap();
        assert_eq!(dispatcher.disconnect(&id), Ok(()));
        assert_eq!(dispatcher.disconnect(&id), Err(BayeuxError::UnknownSession));
        assert_eq!(dispatcher.registry().subscription_count(), 0);
        assert_eq!(dispatcher.holder().state(&id), None);
        assert!(dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn sweep_expires_parked_session() {
        let dispatcher = dispatcher(5_000);
        let id = dispatcher.handshake();
        let connect = spawn_connect(&dispatcher, &id);
        wait_for_waiting(&dispatcher, &id).await;

        let later = Utc::now() + chrono::TimeDelta::seconds(120);
        assert_eq!(dispatcher.sweep(later), vec![id.clone()]);
        assert_eq!(connect.await.unwrap(), Err(BayeuxError::SessionExpired));
        assert!(!dispatcher.sessions().contains(&id));
    }

    #[tokio::test]
    async fn batch_is_coalesced_per_session() {
        let dispatcher = dispatcher(5_000);
        let a = dispatcher.handshake();
        let b = dispatcher.handshake();
        dispatcher.subscribe(&a, "/foo/*").unwrap();
        dispatcher.subscribe(&b, "/foo/bar").unwrap();

        let connect_a = spawn_connect(&dispatcher, &a);
        wait_for_waiting(&dispatcher, &a).await;

        let ids = dispatcher
            .publish_batch(vec![
                ("/foo/bar".to_string(), json!(1)),
                ("/foo/baz".to_string(), json!(2)),
                ("/other".to_string(), json!(3)),
                ("/foo/bar".to_string(), json!(4)),
            ])
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        // A single wakeup carried everything for `a`
        let messages = connect_a.await.unwrap().unwrap();
        let got: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![1, 2, 4]);

        let messages = dispatcher.connect(&b, "long-polling").await.unwrap();
        let got: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![1, 4]);
    }

    #[tokio::test]
    async fn invalid_batch_publishes_nothing() {
        let dispatcher = dispatcher(100);
        let result = dispatcher.publish_batch(vec![
            ("/ok".to_string(), json!(1)),
            ("/bad/*".to_string(), json!(2)),
        ]);
        assert!(result.is_err());
        assert_eq!(dispatcher.publish("/ok", json!(1)), Ok(1));
    }

    #[tokio::test]
    async fn disconnect_all_releases_parked_connects() {
        let dispatcher = dispatcher(5_000);
        let a = dispatcher.handshake();
        let b = dispatcher.handshake();
        let connect = spawn_connect(&dispatcher, &a);
        wait_for_waiting(&dispatcher, &a).await;

        assert_eq!(dispatcher.disconnect_all(), 2);
        assert_eq!(connect.await.unwrap(), Err(BayeuxError::Disconnected));
        assert!(!dispatcher.sessions().contains(&b));
        assert!(dispatcher.holder().is_empty());
    }

    #[tokio::test]
    async fn sweeper_expires_idle_sessions_on_its_own() {
        let config = BayeuxConfigBuilder::default()
            .long_poll_timeout(Duration::from_millis(50))
            .session_timeout(Duration::from_millis(100))
            .sweep_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(config));
        let id = dispatcher.handshake();
        dispatcher.subscribe(&id, "/idle/*").unwrap();

        let token = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move { dispatcher.run_sweeper(token).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!dispatcher.sessions().contains(&id));
        assert_eq!(dispatcher.holder().state(&id), None);
        assert_eq!(dispatcher.registry().subscription_count(), 0);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let config = BayeuxConfigBuilder::default()
            .sweep_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(config));
        let token = CancellationToken::new();
        let task = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move { dispatcher.run_sweeper(token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
