//! Holds long-poll connects until there is something to answer them with
//!
//! Each session owns a mailbox with at most one parked connect and a bounded
//! backlog. The per-session state machine is:
//!
//! ```text
//!            park (backlog empty)
//!   IDLE ----------------------------> WAITING
//!    ^                                    |
//!    |  deliver: wake with the batch      |
//!    |  deadline: empty answer            |
//!    |  cancel: SessionExpired/Disconnected
//!    +------------------------------------+
//! ```
//!
//! Delivering happens inside the mailbox lock, so two deliveries can never
//! wake the same connect. A deliver that finds nobody waiting appends to the
//! backlog, which is handed out by the next park without waiting. When the
//! backlog is over capacity the oldest messages are dropped, so slow consumers
//! lose messages rather than slowing down publishers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};

use crate::errors::{BayeuxError, CancelReason};
use crate::message::Message;
use crate::session::SessionId;

/// Observable state of a session's mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Waiting { arrived_at: Instant, deadline: Instant },
}

/// What a [LongPollHolder::deliver] call did with the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the parked connect
    Woken,
    /// Appended to the backlog, `evicted` older messages were dropped to make
    /// room
    Queued { evicted: usize },
    /// The session has no mailbox (never registered, or cancelled)
    NoSession,
    /// A connect was registered as waiting but its receiving end is gone.
    /// The batch went to the backlog; the session should be dropped.
    Orphaned,
}

#[derive(Debug)]
enum Wakeup {
    Messages(Vec<Message>),
    Cancelled(CancelReason),
}

#[derive(Debug)]
struct PendingConnect {
    ticket: u64,
    arrived_at: Instant,
    deadline: Instant,
    responder: oneshot::Sender<Wakeup>,
}

#[derive(Debug, Default)]
struct Mailbox {
    pending: Option<PendingConnect>,
    backlog: VecDeque<Message>,
    dropped: u64,
}

impl Mailbox {
    /// Drops from the front until the backlog fits, returns how many went
    fn trim(&mut self, capacity: usize) -> usize {
        let excess = self.backlog.len().saturating_sub(capacity);
        self.backlog.drain(..excess);
        self.dropped += excess as u64;
        excess
    }

    fn enqueue(&mut self, messages: Vec<Message>, capacity: usize) -> usize {
        self.backlog.extend(messages);
        self.trim(capacity)
    }

    /// Puts messages back in front of the backlog, they are older than
    /// anything queued after them
    fn requeue(&mut self, messages: Vec<Message>, capacity: usize) -> usize {
        for message in messages.into_iter().rev() {
            self.backlog.push_front(message);
        }
        self.trim(capacity)
    }
}

type MailboxEntry = Arc<Mutex<Mailbox>>;

/// Per-session long-poll slots and backlogs
#[derive(Debug)]
pub struct LongPollHolder {
    mailboxes: DashMap<SessionId, MailboxEntry>,
    backlog_capacity: usize,
    tickets: AtomicU64,
}

impl LongPollHolder {
    pub fn new(backlog_capacity: usize) -> LongPollHolder {
        LongPollHolder {
            mailboxes: DashMap::new(),
            backlog_capacity,
            tickets: AtomicU64::new(0),
        }
    }

    pub fn backlog_capacity(&self) -> usize {
        self.backlog_capacity
    }

    fn mailbox(&self, session: &SessionId) -> Option<MailboxEntry> {
        self.mailboxes.get(session).map(|m| m.value().clone())
    }

    /// Creates the mailbox for a new session
    pub fn register(&self, session: &SessionId) {
        self.mailboxes.entry(session.clone()).or_default();
    }

    /// Waits for messages for `session`, until `deadline` at most
    ///
    /// - backlog not empty: returns it right away
    /// - messages delivered while waiting: returns them
    /// - deadline reached: returns an empty batch
    /// - session cancelled while waiting: returns the cancel reason as error
    ///
    /// A second park while one is already waiting fails with
    /// [BayeuxError::AlreadyWaiting]. Dropping the returned future releases
    /// the slot; anything delivered to it but not yet read goes back to the
    /// backlog.
    pub async fn park(
        &self,
        session: &SessionId,
        deadline: Instant,
    ) -> Result<Vec<Message>, BayeuxError> {
        let mailbox = self.mailbox(session).ok_or(BayeuxError::UnknownSession)?;
        let parked = {
            let mut guard = mailbox.lock();
            if guard.pending.is_some() {
                return Err(BayeuxError::AlreadyWaiting);
            }
            if !guard.backlog.is_empty() {
                let messages: Vec<Message> = guard.backlog.drain(..).collect();
                debug!(session_id:% = session, count = messages.len(); "backlog drained");
                return Ok(messages);
            }

            let (responder, receiver) = oneshot::channel();
            let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
            guard.pending = Some(PendingConnect {
                ticket,
                arrived_at: Instant::now(),
                deadline,
                responder,
            });
            ParkedConnect {
                mailbox: mailbox.clone(),
                ticket,
                receiver,
                capacity: self.backlog_capacity,
                finished: false,
            }
        };
        debug!(session_id:% = session; "connect parked");
        parked.wait(deadline).await
    }

    /// Hands `messages` to the session's parked connect, or queues them
    pub fn deliver(&self, session: &SessionId, messages: Vec<Message>) -> Delivery {
        let Some(mailbox) = self.mailbox(session) else {
            return Delivery::NoSession;
        };
        let mut guard = mailbox.lock();

        if let Some(pending) = guard.pending.take() {
            let wakeup = match pending.responder.send(Wakeup::Messages(messages)) {
                Ok(()) => {
                    debug!(session_id:% = session; "parked connect woken");
                    return Delivery::Woken;
                }
                Err(wakeup) => wakeup,
            };
            error!(session_id:% = session, ticket = pending.ticket;
                   "parked connect lost its receiver while still registered");
            if let Wakeup::Messages(messages) = wakeup {
                guard.enqueue(messages, self.backlog_capacity);
            }
            return Delivery::Orphaned;
        }

        let evicted = guard.enqueue(messages, self.backlog_capacity);
        if evicted > 0 {
            warn!(session_id:% = session,
                  evicted = evicted,
                  capacity = self.backlog_capacity;
                  "backlog full, dropped oldest messages");
        }
        Delivery::Queued { evicted }
    }

    /// Releases the parked connect (if any) with `reason` and forgets the
    /// session. Returns whether the session had a mailbox.
    pub fn cancel(&self, session: &SessionId, reason: CancelReason) -> bool {
        let Some((_, mailbox)) = self.mailboxes.remove(session) else {
            return false;
        };
        let mut guard = mailbox.lock();
        if let Some(pending) = guard.pending.take() {
            debug!(session_id:% = session, reason:? = reason; "parked connect cancelled");
            pending.responder.send(Wakeup::Cancelled(reason)).ok();
        }
        true
    }

    pub fn state(&self, session: &SessionId) -> Option<PollState> {
        let mailbox = self.mailbox(session)?;
        let guard = mailbox.lock();
        let state = match &guard.pending {
            Some(pending) => PollState::Waiting {
                arrived_at: pending.arrived_at,
                deadline: pending.deadline,
            },
            None => PollState::Idle,
        };
        Some(state)
    }

    pub fn backlog_len(&self, session: &SessionId) -> Option<usize> {
        Some(self.mailbox(session)?.lock().backlog.len())
    }

    /// Messages evicted from this session's backlog so far
    pub fn dropped(&self, session: &SessionId) -> Option<u64> {
        Some(self.mailbox(session)?.lock().dropped)
    }

    pub fn len(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.is_empty()
    }
}

/// The waiting half of a park. Dropping it before it finishes puts the
/// mailbox back to idle.
struct ParkedConnect {
    mailbox: MailboxEntry,
    ticket: u64,
    receiver: oneshot::Receiver<Wakeup>,
    capacity: usize,
    finished: bool,
}

impl ParkedConnect {
    async fn wait(mut self, deadline: Instant) -> Result<Vec<Message>, BayeuxError> {
        let woken = tokio::select! {
            wakeup = &mut self.receiver => Some(wakeup),
            _ = sleep_until(deadline) => None,
        };
        let result = match woken {
            Some(Ok(wakeup)) => Self::answer(wakeup),
            // Mailbox dropped without a cancel
            Some(Err(_)) => Err(BayeuxError::SessionExpired),
            None => self.expire(),
        };
        self.finished = true;
        result
    }

    fn answer(wakeup: Wakeup) -> Result<Vec<Message>, BayeuxError> {
        match wakeup {
            Wakeup::Messages(messages) => Ok(messages),
            Wakeup::Cancelled(reason) => Err(reason.into()),
        }
    }

    /// Deadline reached. A deliver or cancel may have won the race for the
    /// mailbox lock, in which case its wakeup is already in the receiver.
    fn expire(&mut self) -> Result<Vec<Message>, BayeuxError> {
        let mut guard = self.mailbox.lock();
        if guard.pending.as_ref().map(|p| p.ticket) == Some(self.ticket) {
            guard.pending = None;
            return Ok(vec![]);
        }
        drop(guard);
        match self.receiver.try_recv() {
            Ok(wakeup) => Self::answer(wakeup),
            Err(_) => Ok(vec![]),
        }
    }
}

impl Drop for ParkedConnect {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut guard = self.mailbox.lock();
        if guard.pending.as_ref().map(|p| p.ticket) == Some(self.ticket) {
            guard.pending = None;
            return;
        }
        if let Ok(Wakeup::Messages(messages)) = self.receiver.try_recv() {
            guard.requeue(messages, self.capacity);
        }
    }
}
