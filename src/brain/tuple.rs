//! Core data types shared by every brain backend
//!
//! - `Tuple`: one prefix → suffix fact
//! - `MessageMeta`: provenance of a learned message

use crate::brain::error::{BrainError, BrainResult};
use crate::brain::userhash::UserHash;
use crate::brain::words::reduce_entropy;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The reserved empty token marking the start or end of a message.
pub const SENTINEL: &str = "";

/// A single prefix → suffix fact learned from a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    /// Literal prefix, oldest term first. Start-of-message slots hold the
    /// sentinel. Stores match on `key()`.
    pub prefix: Vec<String>,
    /// Literal successor token, or the sentinel at end of message
    pub suffix: String,
}

impl Tuple {
    pub fn new(prefix: Vec<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix,
            suffix: suffix.into(),
        }
    }

    /// Entropy-reduced prefix used as the lookup key
    pub fn key(&self) -> Vec<String> {
        self.prefix.iter().map(|w| reduce_entropy(w)).collect()
    }

    /// Whether this tuple begins a message
    pub fn is_start(&self) -> bool {
        self.prefix.iter().all(|w| w.is_empty())
    }

    /// Whether this tuple ends a message
    pub fn is_end(&self) -> bool {
        self.suffix.is_empty()
    }
}

/// Provenance of a learned message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    /// Unique message identifier
    pub id: Uuid,
    /// Hashed identity of the sender
    pub user: UserHash,
    /// Tag the message is learned under
    pub tag: String,
    /// When the message was sent
    pub time: DateTime<Utc>,
}

impl MessageMeta {
    pub fn new(id: Uuid, user: UserHash, tag: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            id,
            user,
            tag: tag.into(),
            time,
        }
    }
}

/// Build the sliding window of tuples for a tokenized message.
///
/// The window starts filled with sentinels, so the first tuple records how
/// the message begins, and a final tuple with the sentinel suffix records how
/// it ends. Every term keeps its case; see `Tuple::key` for the match key.
pub fn tuples_of(order: usize, toks: &[String]) -> BrainResult<Vec<Tuple>> {
    if order == 0 {
        return Err(BrainError::InvalidArgument("order must be positive".into()));
    }
    if toks.is_empty() {
        return Err(BrainError::InvalidArgument(
            "cannot learn a message with no tokens".into(),
        ));
    }

    let mut window = vec![String::new(); order];
    let mut tuples = Vec::with_capacity(toks.len() + 1);
    for w in toks {
        tuples.push(Tuple::new(window.clone(), w.as_str()));
        window.rotate_left(1);
        window[order - 1] = w.clone();
    }
    tuples.push(Tuple::new(window, SENTINEL));
    Ok(tuples)
}
