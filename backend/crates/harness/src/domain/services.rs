//! Domain Services
//!
//! Hashcash-style proof-of-work: the response is accepted when the top
//! `difficulty` bits of the first four bytes of `SHA-256(prefix ++ response)`
//! are all zero.

use crate::domain::value_objects::Difficulty;
use platform::crypto::sha256_concat;

/// SHA-256 of the prefix text followed by the response text
pub fn proof_hash(prefix: &str, response: &str) -> [u8; 32] {
    sha256_concat(&[prefix.as_bytes(), response.as_bytes()])
}

/// First four bytes of the hash as a big-endian integer
pub fn leading_word(hash: &[u8; 32]) -> u32 {
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

pub fn meets_difficulty(hash: &[u8; 32], difficulty: Difficulty) -> bool {
    let shift = 32 - u32::from(difficulty.bits());
    leading_word(hash).checked_shr(shift).unwrap_or(0) == 0
}

pub fn verify_response(prefix: &str, response: &str, difficulty: Difficulty) -> bool {
    meets_difficulty(&proof_hash(prefix, response), difficulty)
}

/// Brute-force a response by counting upward in decimal
///
/// Expected cost is `2^difficulty` hashes.
pub fn solve(prefix: &str, difficulty: Difficulty, max_attempts: u64) -> Option<String> {
    (0..max_attempts)
        .map(|n| n.to_string())
        .find(|candidate| verify_response(prefix, candidate, difficulty))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_with_word(word: u32) -> [u8; 32] {
        let mut hash = [0xFFu8; 32];
        hash[..4].copy_from_slice(&word.to_be_bytes());
        hash
    }

    #[test]
    fn test_meets_difficulty_boundaries() {
        let d16 = Difficulty::new(16).unwrap();
        assert!(meets_difficulty(&hash_with_word(0x0000_FFFF), d16));
        assert!(!meets_difficulty(&hash_with_word(0x0001_0000), d16));

        let d20 = Difficulty::new(20).unwrap();
        assert!(meets_difficulty(&hash_with_word(0x0000_0FFF), d20));
        assert!(!meets_difficulty(&hash_with_word(0x0000_1000), d20));

        let d32 = Difficulty::new(32).unwrap();
        assert!(meets_difficulty(&hash_with_word(0), d32));
        assert!(!meets_difficulty(&hash_with_word(1), d32));
    }

    #[test]
    fn test_only_first_four_bytes_count() {
        let mut hash = [0u8; 32];
        hash[4] = 0xFF;
        assert!(meets_difficulty(&hash, Difficulty::new(32).unwrap()));
    }

    #[test]
    fn test_proof_hash_is_plain_concatenation() {
        let expected = platform::crypto::sha256(b"abc123");
        assert_eq!(proof_hash("abc", "123"), expected);
        assert_eq!(proof_hash("ab", "c123"), expected);
    }

    #[test]
    fn test_solve_produces_verifiable_response() {
        let difficulty = Difficulty::new(16).unwrap();
        let response = solve("00ff00ff", difficulty, 10_000_000).expect("solution");
        assert!(verify_response("00ff00ff", &response, difficulty));
        assert!(leading_word(&proof_hash("00ff00ff", &response)) < 1 << 16);
    }
}
