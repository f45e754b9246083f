//! Session ID Generation and Parsing
//!
//! Generates human-friendly session identifiers that can be read over voice
//! chat or pasted into a join field.

use std::fmt;

/// Characters used in session IDs (unambiguous, uppercase)
/// Excludes: 0/O, 1/I/L, 5/S, 2/Z to avoid confusion
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

/// Session ID length (8 chars = ~282 trillion combinations with 27-char alphabet)
const ID_LENGTH: usize = 8;

/// A session identifier that can be shared to join a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a random session ID using cryptographically secure RNG
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let mut id = String::with_capacity(ID_LENGTH);
        for _ in 0..ID_LENGTH {
            let idx = rng.gen_range(0..ALPHABET.len());
            id.push(ALPHABET[idx] as char);
        }
        SessionId(id)
    }

    /// Get the session ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a session ID from user input
    ///
    /// Normalizes to uppercase, strips separators, and validates format.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != ID_LENGTH {
            return None;
        }

        if normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            Some(SessionId(normalized))
        } else {
            None
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Format as XXXX-XXXX for readability
        if self.0.len() == ID_LENGTH {
            write!(f, "{}-{}", &self.0[..4], &self.0[4..])
        } else {
            write!(f, "{}", self.0)
        }
    }
}
