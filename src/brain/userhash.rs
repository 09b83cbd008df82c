//! User hashes
//!
//! Raw user identities never reach the store. A `UserHasher` derives an opaque
//! 32-byte value from a secret key, the user ID, the location the message was
//! seen in, and the message time truncated to `TIME_QUANTUM_SECS`. Forgetting by
//! user therefore works for messages from one location within one quantum
//! window, which is the granularity chat moderation needs.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

/// Width of the time buckets mixed into a user hash, in seconds
pub const TIME_QUANTUM_SECS: i64 = 15 * 60;

/// Opaque one-way identity of a message sender
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UserHash(pub [u8; 32]);

impl UserHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rebuild a hash from stored bytes. Returns `None` on a length mismatch.
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(b).ok().map(UserHash)
    }
}

impl fmt::Debug for UserHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserHash(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "…)")
    }
}

/// Keyed hasher producing `UserHash` values
#[derive(Clone)]
pub struct UserHasher {
    key: Vec<u8>,
}

impl UserHasher {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Hash a user ID seen at a location at a time.
    pub fn hash(&self, uid: &str, location: &str, time: DateTime<Utc>) -> UserHash {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        let bucket = time.timestamp().div_euclid(TIME_QUANTUM_SECS);
        mac.update(uid.as_bytes());
        mac.update(&[0]);
        mac.update(location.as_bytes());
        mac.update(&[0]);
        mac.update(&bucket.to_be_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        UserHash(out)
    }
}

impl fmt::Debug for UserHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserHasher").finish_non_exhaustive()
    }
}
