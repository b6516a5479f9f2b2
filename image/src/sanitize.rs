//! Name sanitisation for the metadump writer. Two
//! modes: garbage (random printable bytes) and CRC-preserving collision
//! (same length, same `CRC32C(!1, bytes)` as the original name). The
//! collision search falls back to garbage when no match is found within
//! its attempt budget rather than erroring or blocking indefinitely.

use fsforge_core::crc32c_seeded;
use rand::Rng;
use std::collections::HashMap;

/// `~1` seed used by the CRC utility and the collision search, shared with
/// `fsforge_core::checksum`.
const CRC_SEED: u32 = !1u32;

/// Printable alphabet the collision search and the garbage generator draw
/// from, excluding `/` (the only byte a path component name cannot contain).
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789._-";

/// How many candidates the collision search tries before giving up and
/// falling back to garbage. The fallback does not attempt to preserve any
/// index/hash relationship with the original name either (Open
/// Question).
const MAX_COLLISION_ATTEMPTS: u64 = 2_000_000;

pub enum SanitizeMode {
    /// Replace each byte with a random printable.
    Garbage,
    /// Brute-force a same-length, same-CRC replacement, falling back to
    /// garbage on failure.
    CrcPreserving,
}

/// Caches original name -> replacement so repeated names get the same
/// substitution ("Caches results in an ordered set keyed by
/// original bytes").
#[derive(Default)]
pub struct Sanitizer {
    cache: HashMap<Vec<u8>, Vec<u8>>,
}

impl Sanitizer {
    pub fn new() -> Self {
        Sanitizer::default()
    }

    pub fn sanitize(&mut self, mode: &SanitizeMode, original: &[u8]) -> Vec<u8> {
        if let Some(cached) = self.cache.get(original) {
            return cached.clone();
        }
        let replacement = match mode {
            SanitizeMode::Garbage => garbage(original.len()),
            SanitizeMode::CrcPreserving => find_collision(original).unwrap_or_else(|| garbage(original.len())),
        };
        self.cache.insert(original.to_vec(), replacement.clone());
        replacement
    }
}

fn garbage(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())]).collect()
}

/// Brute-force search of the printable alphabet for a string of
/// `original.len()` bytes whose `CRC32C(!1, bytes)` matches `original`'s.
/// Returns `None` if no match is found within the attempt budget, in which
/// case the caller falls back to [`garbage`].
fn find_collision(original: &[u8]) -> Option<Vec<u8>> {
    if original.is_empty() {
        return Some(Vec::new());
    }
    let target = crc32c_seeded(CRC_SEED, original);
    let len = original.len();
    let mut rng = rand::thread_rng();
    let mut candidate = vec![0u8; len];
    for _ in 0..MAX_COLLISION_ATTEMPTS {
        for b in candidate.iter_mut() {
            *b = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        if crc32c_seeded(CRC_SEED, &candidate) == target {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_equal_length_and_differs() {
        let mut s = Sanitizer::new();
        let out = s.sanitize(&SanitizeMode::Garbage, b"hello");
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn repeated_names_reuse_replacement() {
        let mut s = Sanitizer::new();
        let a = s.sanitize(&SanitizeMode::Garbage, b"hello");
        let b = s.sanitize(&SanitizeMode::Garbage, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn crc_preserving_mode_preserves_length_even_on_fallback() {
        // The printable alphabet has far fewer than 2^32 two-byte strings,
        // so a brute-force collision for a short name essentially never
        // exists; this exercises the documented garbage fallback instead of
        // depending on a collision being found.
        let mut s = Sanitizer::new();
        let original = b"ab";
        let out = s.sanitize(&SanitizeMode::CrcPreserving, original);
        assert_eq!(out.len(), original.len());
        assert!(out.iter().all(|b| ALPHABET.contains(b)));
    }

    #[test]
    fn find_collision_result_always_matches_target_when_some() {
        let original = b"ab";
        if let Some(found) = find_collision(original) {
            assert_eq!(
                crc32c_seeded(CRC_SEED, &found),
                crc32c_seeded(CRC_SEED, original)
            );
        }
    }

    #[test]
    fn empty_name_sanitizes_to_empty() {
        let mut s = Sanitizer::new();
        assert_eq!(s.sanitize(&SanitizeMode::CrcPreserving, b""), Vec::<u8>::new());
    }
}
