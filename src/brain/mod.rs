//! Brain capabilities
//!
//! A brain learns word sequences from chat messages and speaks new messages
//! from what it has learned. Backends implement three capabilities:
//!
//! - **Learner**: records the tuples of one message atomically
//! - **Speaker**: finds prompts and walks chains to build messages
//! - **Forgetter**: removes learned data by provenance
//!
//! # Architecture
//!
//! ```text
//! Learn:  text → tokens → sliding window of tuples → commit (one transaction)
//!
//! Speak:  prompt text → tokens → pad/clip to order → chain walk → trim → join
//!           (no prompt → new_prompt)
//!
//! Forget: criterion → delete occurrences, reduce weights (one transaction)
//! ```

pub mod error;
pub mod tuple;
pub mod userhash;
pub mod words;

pub use error::{BrainError, BrainResult};
pub use tuple::{tuples_of, MessageMeta, Tuple, SENTINEL};
pub use userhash::{UserHash, UserHasher};
pub use words::{reduce_entropy, tokens};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Records messages into a brain.
#[async_trait]
pub trait Learner: Send + Sync {
    /// Length of tuple prefixes
    fn order(&self) -> usize;

    /// Record every tuple derived from one message. Either all tuples are
    /// recorded or none are.
    async fn commit(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        tuples: &[Tuple],
    ) -> BrainResult<()>;

    /// Learn a tokenized message.
    async fn learn(
        &self,
        cancel: &CancellationToken,
        meta: &MessageMeta,
        toks: &[String],
    ) -> BrainResult<()> {
        let tuples = tuples_of(self.order(), toks)?;
        self.commit(cancel, meta, &tuples).await
    }
}

/// Produces random messages.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Length of prompts given to `speak`
    fn order(&self) -> usize;

    /// Find a prompt to begin a random message using only data learned under
    /// `tag`. The result is suitable to pass directly to `speak`.
    async fn new_prompt(&self, cancel: &CancellationToken, tag: &str) -> BrainResult<Vec<String>>;

    /// Generate a full message continuing `prompt`, which must hold exactly
    /// `order` tokens. The result begins with the prompt. Only data learned
    /// under `tag` is used.
    async fn speak(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        prompt: &[String],
    ) -> BrainResult<Vec<String>>;
}

/// Removes learned data. Each method returns the number of tuple occurrences
/// removed. Backends that cannot forget in some way report `Unsupported`.
#[async_trait]
pub trait Forgetter: Send + Sync {
    /// Forget everything learned from one message.
    async fn forget_message(&self, _cancel: &CancellationToken, _msg: Uuid) -> BrainResult<u64> {
        Err(BrainError::Unsupported {
            operation: "forget_message",
        })
    }

    /// Forget messages learned under `tag` with `since <= time < before`.
    async fn forget_during(
        &self,
        _cancel: &CancellationToken,
        _tag: &str,
        _since: DateTime<Utc>,
        _before: DateTime<Utc>,
    ) -> BrainResult<u64> {
        Err(BrainError::Unsupported {
            operation: "forget_during",
        })
    }

    /// Forget messages from `user` at or after `since`.
    async fn forget_user_since(
        &self,
        _cancel: &CancellationToken,
        _user: &UserHash,
        _since: DateTime<Utc>,
    ) -> BrainResult<u64> {
        Err(BrainError::Unsupported {
            operation: "forget_user_since",
        })
    }

    /// Forget messages from any of `users` at or after `since`, all in one
    /// step.
    async fn forget_users_since(
        &self,
        _cancel: &CancellationToken,
        _users: &[UserHash],
        _since: DateTime<Utc>,
    ) -> BrainResult<u64> {
        Err(BrainError::Unsupported {
            operation: "forget_users_since",
        })
    }

    /// Forget one occurrence of each tuple regardless of who taught it.
    async fn forget_tuples(
        &self,
        _cancel: &CancellationToken,
        _tag: &str,
        _tuples: &[Tuple],
    ) -> BrainResult<u64> {
        Err(BrainError::Unsupported {
            operation: "forget_tuples",
        })
    }
}

/// Tokenize and learn a message.
pub async fn learn<L: Learner + ?Sized>(
    l: &L,
    cancel: &CancellationToken,
    meta: &MessageMeta,
    text: &str,
) -> BrainResult<()> {
    let toks = tokens(text);
    l.learn(cancel, meta, &toks).await
}

/// Generate a message from prompt tokens.
///
/// With no prompt, one is obtained from the speaker. Otherwise the prompt is
/// left-padded with sentinels or clipped to its last `order` tokens. Sentinels
/// at either end of the result are trimmed.
pub async fn generate<S: Speaker + ?Sized>(
    s: &S,
    cancel: &CancellationToken,
    tag: &str,
    mut prompt: Vec<String>,
) -> BrainResult<Vec<String>> {
    if prompt.is_empty() {
        prompt = s.new_prompt(cancel, tag).await?;
    } else {
        let n = s.order();
        if prompt.len() < n {
            let mut padded = vec![String::new(); n - prompt.len()];
            padded.append(&mut prompt);
            prompt = padded;
        } else if prompt.len() > n {
            prompt.drain(..prompt.len() - n);
        }
    }
    let r = s.speak(cancel, tag, &prompt).await?;
    Ok(trim(r))
}

/// Produce a new message from a prompt string, which may be empty.
pub async fn speak<S: Speaker + ?Sized>(
    s: &S,
    cancel: &CancellationToken,
    tag: &str,
    prompt: &str,
) -> BrainResult<String> {
    let r = generate(s, cancel, tag, tokens(prompt)).await?;
    Ok(r.join(" "))
}

/// Remove sentinels from the start and end of r.
fn trim(mut r: Vec<String>) -> Vec<String> {
    while r.last().is_some_and(|w| w.is_empty()) {
        r.pop();
    }
    let start = r.iter().position(|w| !w.is_empty()).unwrap_or(r.len());
    r.drain(..start);
    r
}
