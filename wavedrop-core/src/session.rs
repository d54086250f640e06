//! Session keys: short human-copyable strings correlating an offer with its answer.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of generated keys.
pub const KEY_LEN: usize = 6;

/// Longest key accepted from the outside (typed, scanned or heard).
pub const MAX_KEY_LEN: usize = 32;

/// Suffix appended to a key to name its answer.
pub const ANSWER_SUFFIX: &str = "-ans";

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Lookup key for one negotiation. Never secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionKeyError {
    #[error("session key is empty")]
    Empty,
    #[error("session key longer than {} characters", MAX_KEY_LEN)]
    TooLong,
    #[error("session key contains {0:?}; printable ASCII without spaces only")]
    InvalidCharacter(char),
}

impl SessionKey {
    /// Random key of `KEY_LEN` characters from `[A-Z0-9]`.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let key = (0..KEY_LEN)
            .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
            .collect();
        SessionKey(key)
    }

    /// Validate a key received out of band.
    pub fn parse(s: &str) -> Result<Self, SessionKeyError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SessionKeyError::Empty);
        }
        if s.len() > MAX_KEY_LEN {
            return Err(SessionKeyError::TooLong);
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(SessionKeyError::InvalidCharacter(c));
        }
        Ok(SessionKey(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which the answer to this key's offer is published.
    pub fn answer_key(&self) -> String {
        format!("{}{}", self.0, ANSWER_SUFFIX)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
