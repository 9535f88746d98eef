//! Seeded Random Number Generator
//!
//! Xorshift128+ seeded through SplitMix64. Used for roster selection and the
//! default duel simulator, where the same seed must replay the same rounds.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Seeded PRNG using the Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use versus_oracle::core::rng::SeededRng;
///
/// let mut a = SeededRng::new(12345);
/// let mut b = SeededRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeededRng {
    state: [u64; 2],
}

impl Default for SeededRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SeededRng {
    /// Create a new RNG from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // All-zero state would lock the generator at zero
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG for a specific round and competitor pair.
    pub fn for_round(round_number: u64, competitor_a: &str, competitor_b: &str) -> Self {
        Self::new(derive_round_seed(round_number, competitor_a, competitor_b))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        (self.next_u64() % max as u64) as u32
    }

    /// Generate a float in [0, 1) from the upper 53 bits.
    #[inline]
    pub fn next_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Pick two distinct indices in [0, len). Returns None when len < 2.
    pub fn distinct_pair(&mut self, len: usize) -> Option<(usize, usize)> {
        if len < 2 {
            return None;
        }
        let first = self.next_int(len as u32) as usize;
        // Offset into the remaining len - 1 slots so the pair never collides
        let offset = 1 + self.next_int((len - 1) as u32) as usize;
        Some((first, (first + offset) % len))
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive the seed for one round's duel simulation.
///
/// The competitor order matters: (A, B) and (B, A) are different matchups.
pub fn derive_round_seed(round_number: u64, competitor_a: &str, competitor_b: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"VERSUS_ORACLE_ROUND_V1");
    hasher.update(round_number.to_le_bytes());
    // Length prefixes keep ("ab", "c") distinct from ("a", "bc")
    hasher.update((competitor_a.len() as u32).to_le_bytes());
    hasher.update(competitor_a.as_bytes());
    hasher.update((competitor_b.len() as u32).to_le_bytes());
    hasher.update(competitor_b.as_bytes());
    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_determinism() {
        let mut rng1 = SeededRng::new(12345);
        let mut rng2 = SeededRng::new(12345);

        for _ in 0..1000 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_different_seeds() {
        let mut rng1 = SeededRng::new(12345);
        let mut rng2 = SeededRng::new(54321);
        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_next_int_bounds() {
        let mut rng = SeededRng::new(1234);
        for _ in 0..1000 {
            assert!(rng.next_int(100) < 100);
        }
        assert_eq!(rng.next_int(0), 0);
        assert_eq!(rng.next_int(1), 0);
    }

    #[test]
    fn test_next_unit_range() {
        let mut rng = SeededRng::new(9999);
        for _ in 0..1000 {
            let v = rng.next_unit();
            assert!((0.0..1.0).contains(&v));
        }
    }

    #[test]
    fn test_distinct_pair() {
        let mut rng = SeededRng::new(42);
        assert!(rng.distinct_pair(0).is_none());
        assert!(rng.distinct_pair(1).is_none());

        for _ in 0..1000 {
            let (a, b) = rng.distinct_pair(2).unwrap();
            assert_ne!(a, b);
            assert!(a < 2 && b < 2);
        }
        for _ in 0..1000 {
            let (a, b) = rng.distinct_pair(7).unwrap();
            assert_ne!(a, b);
            assert!(a < 7 && b < 7);
        }
    }

    #[test]
    fn test_derive_round_seed() {
        let seed1 = derive_round_seed(7, "Emberfang", "Tidewhisker");
        let seed2 = derive_round_seed(7, "Emberfang", "Tidewhisker");
        assert_eq!(seed1, seed2);

        assert_ne!(seed1, derive_round_seed(8, "Emberfang", "Tidewhisker"));
        assert_ne!(seed1, derive_round_seed(7, "Tidewhisker", "Emberfang"));
        assert_ne!(derive_round_seed(1, "ab", "c"), derive_round_seed(1, "a", "bc"));
    }

    #[test]
    fn test_clone_continues_identically() {
        let mut rng = SeededRng::new(5555);
        for _ in 0..50 {
            rng.next_u64();
        }

        let mut copy = rng.clone();
        for _ in 0..10 {
            assert_eq!(rng.next_u64(), copy.next_u64());
        }
    }
}
