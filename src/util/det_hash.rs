//! Deterministic hashing for context bookkeeping maps.
//!
//! Child sets, version-owner caches and view caches are keyed by small
//! integer-like ids. A fixed-seed multiplicative hasher keeps iteration order
//! stable across runs, which keeps trace output and test expectations
//! reproducible, and avoids paying for SipHash on every child transition.

use std::hash::{BuildHasher, Hasher};

/// Fixed-seed word-at-a-time hasher.
#[derive(Debug, Clone, Copy)]
pub struct DetHasher {
    hash: u64,
}

impl DetHasher {
    const SEED: u64 = 0x2d35_8dcc_aa6c_78a5;
    const K: u64 = 0x9e37_79b9_7f4a_7c15;

    #[inline]
    fn add_word(&mut self, word: u64) {
        self.hash = (self.hash.rotate_left(5) ^ word).wrapping_mul(Self::K);
    }
}

impl Default for DetHasher {
    fn default() -> Self {
        Self { hash: Self::SEED }
    }
}

impl Hasher for DetHasher {
    fn write(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            self.add_word(u64::from_le_bytes(word));
        }
        let rest = chunks.remainder();
        if !rest.is_empty() {
            let mut word = [0u8; 8];
            word[..rest.len()].copy_from_slice(rest);
            self.add_word(u64::from_le_bytes(word));
        }
    }

    fn write_u32(&mut self, i: u32) {
        self.add_word(u64::from(i));
    }

    fn write_u64(&mut self, i: u64) {
        self.add_word(i);
    }

    fn write_usize(&mut self, i: usize) {
        self.add_word(i as u64);
    }

    fn finish(&self) -> u64 {
        let mut h = self.hash;
        h ^= h >> 31;
        h = h.wrapping_mul(0x7fb5_d329_728e_a185);
        h ^= h >> 27;
        h
    }
}

/// Builder for [`DetHasher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DetBuildHasher;

impl BuildHasher for DetBuildHasher {
    type Hasher = DetHasher;

    fn build_hasher(&self) -> DetHasher {
        DetHasher::default()
    }
}

/// Hash map with reproducible iteration order.
pub type DetHashMap<K, V> = std::collections::HashMap<K, V, DetBuildHasher>;

/// Hash set with reproducible iteration order.
pub type DetHashSet<K> = std::collections::HashSet<K, DetBuildHasher>;
