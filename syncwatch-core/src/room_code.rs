//! Room Code Generation and Parsing
//!
//! Room ids double as share codes, so they use a human-friendly alphabet.
//! Row ids for members reuse the same generator with a longer length.

use std::fmt;

use rand::Rng;

/// Characters used in room codes (unambiguous, uppercase)
/// Excludes: 0/O, 1/I/L, 5/S, 2/Z to avoid confusion
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

/// Room code length (8 chars = ~282 trillion combinations with 27-char alphabet)
const CODE_LENGTH: usize = 8;

/// Row id length for member rows
const ROW_ID_LENGTH: usize = 16;

/// A room code that can be shared to join a room
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a random room code
    pub fn random() -> Self {
        RoomCode(random_string(CODE_LENGTH))
    }

    /// Get the room code as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Parse a room code from user input
    ///
    /// Normalizes to uppercase and validates format.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

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
        // Format as XXXX-XXXX for readability
        if self.0.len() == CODE_LENGTH {
            write!(f, "{}-{}", &self.0[..4], &self.0[4..])
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Generate an opaque row id
pub fn random_row_id() -> String {
    random_string(ROW_ID_LENGTH).to_lowercase()
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_code_parse() {
        let code = RoomCode::parse("ABCD-EFGH").unwrap();
        assert_eq!(code.as_str(), "ABCDEFGH");

        let code = RoomCode::parse("abcd efgh").unwrap();
        assert_eq!(code.as_str(), "ABCDEFGH");

        assert!(RoomCode::parse("ABC").is_none()); // Too short
        assert!(RoomCode::parse("ABCDEFGHI").is_none()); // Too long (9 chars)
        assert!(RoomCode::parse("ABCDEFG0").is_none()); // Ambiguous character
    }

    #[test]
    fn test_room_code_display() {
        let code = RoomCode("ABCDEFGH".to_string());
        assert_eq!(format!("{}", code), "ABCD-EFGH");
    }

    #[test]
    fn test_random_code_round_trips_through_parse() {
        let code = RoomCode::random();
        assert_eq!(code.as_str().len(), CODE_LENGTH);
        assert_eq!(RoomCode::parse(&code.to_string()), Some(code));
    }

    #[test]
    fn test_row_ids_differ() {
        assert_ne!(random_row_id(), random_row_id());
        assert_eq!(random_row_id().len(), ROW_ID_LENGTH);
    }
}
