//! Room code generation and parsing

use std::fmt;

/// Characters used in room codes (base 36, uppercase)
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Room code length
const CODE_LENGTH: usize = 6;

/// A short code identifying a room
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a random room code
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let code = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        RoomCode(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a room code from user input, normalizing to uppercase
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input.trim().to_ascii_uppercase();

        if normalized.len() != CODE_LENGTH {
            return None;
        }

        if normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            Some(RoomCode(normalized))
        } else {
            None
        }
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
