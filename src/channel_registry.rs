//! Maps channel patterns to the sessions subscribed to them
//!
//! Patterns are stored in a segment-indexed trie. Each node keeps its children
//! and subscriber sets in [DashMap]/[DashSet], so lookups on one branch never
//! wait for writes on unrelated branches.
//!
//! A pattern `/a/*/c` lives at `root -> "a" -> "*" -> "c"` in the `exact` set.
//! A pattern `/a/**` lives at `root -> "a"` in the `deep` set, since it matches
//! anything with at least one more segment.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use log::debug;
use parking_lot::RwLock;

use crate::channel::{ChannelName, ChannelPattern, Segment, SINGLE_WILDCARD};
use crate::session::SessionId;

#[derive(Debug, Default)]
struct Node {
    children: DashMap<String, Arc<Node>>,
    /// Sessions whose pattern ends at this node
    exact: DashSet<SessionId>,
    /// Sessions whose pattern ends with `**` right below this node
    deep: DashSet<SessionId>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.deep.is_empty() && self.children.is_empty()
    }

    fn child(&self, key: &str) -> Option<Arc<Node>> {
        self.children.get(key).map(|c| c.value().clone())
    }

    fn child_or_insert(&self, key: &str) -> Arc<Node> {
        self.children
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn collect(&self, segments: &[&str], out: &mut HashSet<SessionId>) {
        let Some((head, rest)) = segments.split_first() else {
            out.extend(self.exact.iter().map(|id| id.key().clone()));
            return;
        };
        out.extend(self.deep.iter().map(|id| id.key().clone()));
        if let Some(child) = self.child(head) {
            child.collect(rest, out);
        }
        if let Some(child) = self.child(SINGLE_WILDCARD) {
            child.collect(rest, out);
        }
    }

    /// Removes empty descendants, returns how many nodes were dropped
    fn prune(&self) -> usize {
        let children: Vec<(String, Arc<Node>)> = self
            .children
            .iter()
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect();

        let mut removed = 0;
        for (key, child) in children {
            removed += child.prune();
            if child.is_empty() && self.children.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

/// Which set of a trie node a pattern ends in
enum Slot {
    Exact,
    Deep,
}

/// Concurrent pattern -> subscribers index
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    root: Arc<Node>,
    subscriptions: AtomicUsize,
    /// Held shared by inserts and exclusively by [ChannelRegistry::compact], so
    /// a node is never pruned while an insert is on its way into it.
    /// [ChannelRegistry::resolve] doesn't take it.
    structure: RwLock<()>,
}

impl ChannelRegistry {
    pub fn new() -> ChannelRegistry {
        ChannelRegistry::default()
    }

    /// Walks the pattern, returning the node it ends at and in which set
    fn walk(&self, pattern: &ChannelPattern, create: bool) -> Option<(Arc<Node>, Slot)> {
        let mut node = self.root.clone();
        for segment in pattern.segments() {
            let key = match segment {
                Segment::Deep => return Some((node, Slot::Deep)),
                Segment::Any => SINGLE_WILDCARD.to_string(),
                Segment::Literal(literal) => literal,
            };
            node = if create {
                node.child_or_insert(&key)
            } else {
                node.child(&key)?
            };
        }
        Some((node, Slot::Exact))
    }

    /// Records the session's interest in `pattern`
    ///
    /// Idempotent: returns `false` if the session was already subscribed to
    /// this exact pattern
    pub fn subscribe(&self, session: &SessionId, pattern: &ChannelPattern) -> bool {
        let _guard = self.structure.read();
        let inserted = match self.walk(pattern, true) {
            Some((node, Slot::Exact)) => node.exact.insert(session.clone()),
            Some((node, Slot::Deep)) => node.deep.insert(session.clone()),
            None => false,
        };
        if inserted {
            self.subscriptions.fetch_add(1, Ordering::Relaxed);
            debug!(session_id:% = session, pattern:% = pattern; "subscribed");
        }
        inserted
    }

    /// Removes the session's interest in `pattern`. Returns whether there was
    /// anything to remove.
    pub fn unsubscribe(&self, session: &SessionId, pattern: &ChannelPattern) -> bool {
        let removed = match self.walk(pattern, false) {
            Some((node, Slot::Exact)) => node.exact.remove(session).is_some(),
            Some((node, Slot::Deep)) => node.deep.remove(session).is_some(),
            None => false,
        };
        if removed {
            self.subscriptions.fetch_sub(1, Ordering::Relaxed);
            debug!(session_id:% = session, pattern:% = pattern; "unsubscribed");
        }
        removed
    }

    /// Every session with at least one pattern matching `channel`, once each
    pub fn resolve(&self, channel: &ChannelName) -> HashSet<SessionId> {
        let segments: Vec<&str> = channel.segments().collect();
        let mut out = HashSet::new();
        self.root.collect(&segments, &mut out);
        out
    }

    /// Sessions subscribed to exactly this pattern
    pub fn subscribers(&self, pattern: &ChannelPattern) -> Vec<SessionId> {
        match self.walk(pattern, false) {
            Some((node, Slot::Exact)) => node.exact.iter().map(|id| id.key().clone()).collect(),
            Some((node, Slot::Deep)) => node.deep.iter().map(|id| id.key().clone()).collect(),
            None => vec![],
        }
    }

    /// Total number of (session, pattern) pairs
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// Drops trie nodes left empty by unsubscriptions
    pub fn compact(&self) -> usize {
        let _guard = self.structure.write();
        self.root.prune()
    }
}
