//! Client sessions and their subscriptions
//!
//! A [Session] is created on handshake and lives until the client disconnects
//! or stops showing up for longer than the configured inactivity timeout.
//!
//! Every session sits behind its own lock. Operations that touch both a
//! session and the [ChannelRegistry] always take the session lock first.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelPattern;
use crate::channel_registry::ChannelRegistry;
use crate::errors::BayeuxError;

const SESSION_ID_LEN: usize = 32;

/// Opaque, unguessable session token (the Bayeux `clientId`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> SessionId {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect();
        SessionId(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client session
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    subscriptions: HashSet<ChannelPattern>,
    connected: bool,
    /// Flipped once the session leaves the table. Anyone still holding the
    /// entry must treat it as gone.
    alive: bool,
}

impl Session {
    fn new(id: SessionId, now: DateTime<Utc>) -> Session {
        Session {
            id,
            created_at: now,
            last_seen_at: now,
            subscriptions: HashSet::new(),
            connected: false,
            alive: true,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> &DateTime<Utc> {
        &self.created_at
    }

    pub fn last_seen_at(&self) -> &DateTime<Utc> {
        &self.last_seen_at
    }

    pub fn subscriptions(&self) -> &HashSet<ChannelPattern> {
        &self.subscriptions
    }

    /// Whether a connect was received since the handshake
    pub fn connected(&self) -> bool {
        self.connected
    }

    fn seen(&mut self, now: DateTime<Utc>) {
        if self.last_seen_at < now {
            self.last_seen_at = now;
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        match self.last_seen_at.checked_add_signed(timeout) {
            Some(deadline) => deadline < now,
            None => false,
        }
    }
}

type SessionEntry = Arc<Mutex<Session>>;

/// All live sessions, indexed by id
#[derive(Debug)]
pub struct SessionTable {
    sessions: DashMap<SessionId, SessionEntry>,
    registry: Arc<ChannelRegistry>,
    timeout: TimeDelta,
}

impl SessionTable {
    pub fn new(registry: Arc<ChannelRegistry>, timeout: Duration) -> SessionTable {
        SessionTable {
            sessions: DashMap::new(),
            registry,
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    fn entry(&self, id: &SessionId) -> Result<SessionEntry, BayeuxError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(BayeuxError::UnknownSession)
    }

    /// Runs `f` on the session while holding its lock
    fn with_session<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T, BayeuxError> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        if !session.alive {
            return Err(BayeuxError::UnknownSession);
        }
        Ok(f(&mut session))
    }

    /// Allocates a new session with no subscriptions
    pub fn create(&self) -> SessionId {
        self.create_at(Utc::now())
    }

    pub fn create_at(&self, now: DateTime<Utc>) -> SessionId {
        loop {
            let id = SessionId::generate();
            if let Entry::Vacant(vacant) = self.sessions.entry(id.clone()) {
                vacant.insert(Arc::new(Mutex::new(Session::new(id.clone(), now))));
                debug!(session_id:% = id; "session created");
                return id;
            }
        }
    }

    /// Marks the session as seen now
    pub fn touch(&self, id: &SessionId) -> Result<(), BayeuxError> {
        self.touch_at(id, Utc::now())
    }

    pub fn touch_at(&self, id: &SessionId, now: DateTime<Utc>) -> Result<(), BayeuxError> {
        self.with_session(id, |session| session.seen(now))
    }

    /// Flags the session as connected, returns `true` on its first connect
    pub fn mark_connected(&self, id: &SessionId) -> Result<bool, BayeuxError> {
        self.with_session(id, |session| !std::mem::replace(&mut session.connected, true))
    }

    /// Adds `pattern` to the session's subscriptions. Returns `false` if it was
    /// already there.
    pub fn subscribe(
        &self,
        id: &SessionId,
        pattern: &ChannelPattern,
    ) -> Result<bool, BayeuxError> {
        self.with_session(id, |session| {
            session.seen(Utc::now());
            if session.subscriptions.insert(pattern.clone()) {
                self.registry.subscribe(id, pattern);
                true
            } else {
                false
            }
        })
    }

    /// Removes `pattern` from the session's subscriptions. Returns `false` if
    /// it wasn't there.
    pub fn unsubscribe(
        &self,
        id: &SessionId,
        pattern: &ChannelPattern,
    ) -> Result<bool, BayeuxError> {
        self.with_session(id, |session| {
            session.seen(Utc::now());
            if session.subscriptions.remove(pattern) {
                self.registry.unsubscribe(id, pattern);
                true
            } else {
                false
            }
        })
    }

    /// Drops a session that already left the map
    fn teardown(&self, entry: SessionEntry) {
        let mut guard = entry.lock();
        let session = &mut *guard;
        session.alive = false;
        for pattern in session.subscriptions.drain() {
            self.registry.unsubscribe(&session.id, &pattern);
        }
    }

    /// Removes the session and its subscriptions. Destroying a session that
    /// doesn't exist is a no-op; returns whether anything was removed.
    pub fn destroy(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, entry)) => {
                self.teardown(entry);
                debug!(session_id:% = id; "session destroyed");
                true
            }
            None => false,
        }
    }

    /// Removes every session not seen within the inactivity timeout and
    /// returns their ids
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let candidates: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().is_expired(now, self.timeout))
            .map(|entry| entry.key().clone())
            .collect();

        // Checked again on removal, the session might have been touched since
        let mut removed = vec![];
        for id in candidates {
            let entry = self
                .sessions
                .remove_if(&id, |_, entry| entry.lock().is_expired(now, self.timeout));
            if let Some((id, entry)) = entry {
                self.teardown(entry);
                removed.push(id);
            }
        }
        if !removed.is_empty() {
            info!(expired = removed.len(); "expired sessions swept");
        }
        removed
    }

    /// Snapshot of the session
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.with_session(id, |session| session.clone()).ok()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
