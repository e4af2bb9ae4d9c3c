//! Channel names and channel patterns
//!
//! Channels are slash-delimited paths such as `/chat/room1`. A subscription
//! uses a [ChannelPattern], which may contain wildcard segments:
//!
//! - `*` matches exactly one segment, in any position (`/chat/*`, `/a/*/c`)
//! - `**` matches one or more trailing segments and must be the last segment
//!   (`/chat/**`)
//!
//! Messages are always published to a concrete [ChannelName].
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::BayeuxError;

pub const SINGLE_WILDCARD: &str = "*";
pub const DEEP_WILDCARD: &str = "**";

/// Channels under this prefix are reserved for the protocol itself
pub const META_PREFIX: &str = "/meta/";

/// Splits `/a/b/c` into `["a", "b", "c"]`, returning `None` when the path does
/// not start with `/` or has an empty segment
fn split_segments(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

/// A concrete channel a message can be published to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    pub fn parse(value: impl Into<String>) -> Result<ChannelName, BayeuxError> {
        let value = value.into();
        let valid = match split_segments(&value) {
            Some(segments) => !segments
                .iter()
                .any(|s| *s == SINGLE_WILDCARD || *s == DEEP_WILDCARD),
            None => false,
        };
        if valid {
            Ok(ChannelName(value))
        } else {
            Err(BayeuxError::InvalidChannel(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segments without the leading slash
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    pub fn is_meta(&self) -> bool {
        self.0.starts_with(META_PREFIX)
    }
}

impl TryFrom<String> for ChannelName {
    type Error = BayeuxError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChannelName::parse(value)
    }
}

impl From<ChannelName> for String {
    fn from(value: ChannelName) -> Self {
        value.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One segment of a [ChannelPattern]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// `*`
    Any,
    /// `**`, always the last segment
    Deep,
}

/// A subscription pattern, possibly with wildcard segments
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelPattern(String);

impl ChannelPattern {
    pub fn parse(value: impl Into<String>) -> Result<ChannelPattern, BayeuxError> {
        let value = value.into();
        let Some(segments) = split_segments(&value) else {
            return Err(BayeuxError::InvalidPattern(value));
        };
        let last = segments.len() - 1;
        let misplaced_deep = segments
            .iter()
            .enumerate()
            .any(|(i, s)| *s == DEEP_WILDCARD && i != last);
        if misplaced_deep {
            return Err(BayeuxError::InvalidPattern(value));
        }
        Ok(ChannelPattern(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        self.0[1..].split('/').map(|s| match s {
            SINGLE_WILDCARD => Segment::Any,
            DEEP_WILDCARD => Segment::Deep,
            literal => Segment::Literal(literal.to_string()),
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments().any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// True for `/meta/...` patterns
    pub fn touches_meta(&self) -> bool {
        self.0.starts_with(META_PREFIX)
    }

    /// Reference implementation of the matching rule. The
    /// [ChannelRegistry](crate::channel_registry::ChannelRegistry) answers the
    /// same question through its trie.
    pub fn matches(&self, channel: &ChannelName) -> bool {
        let mut channel_segments = channel.segments();
        for segment in self.segments() {
            match segment {
                Segment::Deep => return channel_segments.next().is_some(),
                Segment::Any => {
                    if channel_segments.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match channel_segments.next() {
                    Some(s) if s == literal => {}
                    _ => return false,
                },
            }
        }
        channel_segments.next().is_none()
    }
}

impl TryFrom<String> for ChannelPattern {
    type Error = BayeuxError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        ChannelPattern::parse(value)
    }
}

impl From<ChannelPattern> for String {
    fn from(value: ChannelPattern) -> Self {
        value.0
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
