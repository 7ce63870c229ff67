//! Commsmap: a personal communications cartographer.
//!
//! A durable local event store that ingests messages from heterogeneous
//! channels, resolves the humans behind them into one canonical graph, chunks
//! event streams into conversations, and drives an LLM analysis/embedding
//! pipeline over the result.

pub mod adapter;
pub mod bus;
pub mod chunker;
pub mod compute;
pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod resolve;
pub mod store;
pub mod sync;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Communication channel a message arrived on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Imessage,
    Email,
    Gmail,
    Slack,
    Calendar,
    Contacts,
    Aix,
    Bird,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Imessage => "imessage",
            Channel::Email => "email",
            Channel::Gmail => "gmail",
            Channel::Slack => "slack",
            Channel::Calendar => "calendar",
            Channel::Contacts => "contacts",
            Channel::Aix => "aix",
            Channel::Bird => "bird",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sms" => Some(Channel::Sms),
            "imessage" => Some(Channel::Imessage),
            "email" => Some(Channel::Email),
            "gmail" => Some(Channel::Gmail),
            "slack" => Some(Channel::Slack),
            "calendar" => Some(Channel::Calendar),
            "contacts" => Some(Channel::Contacts),
            "aix" => Some(Channel::Aix),
            "bird" => Some(Channel::Bird),
            _ => None,
        }
    }

    /// Channels whose identifiers are strong enough to unify persons on their
    /// own (hard identifiers).
    pub fn is_strong(self) -> bool {
        matches!(
            self,
            Channel::Sms
                | Channel::Imessage
                | Channel::Email
                | Channel::Gmail
                | Channel::Slack
        )
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a communication event relative to the owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
    Observed,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
            Direction::Observed => "observed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            "observed" => Some(Direction::Observed),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a person plays on an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Recipient,
    Cc,
    Bcc,
    Observer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Recipient => "recipient",
            Role::Cc => "cc",
            Role::Bcc => "bcc",
            Role::Observer => "observer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sender" => Some(Role::Sender),
            "recipient" => Some(Role::Recipient),
            "cc" => Some(Role::Cc),
            "bcc" => Some(Role::Bcc),
            "observer" => Some(Role::Observer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current unix timestamp in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh opaque entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// SHA-256 fingerprint, hex-encoded. Used for source payloads and job params.
pub fn fingerprint(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    hex::encode(sha2::Sha256::digest(bytes))
}
