//! Identifier generators.
//!
//! Two implementations are used across the services: a trivial counter for
//! object kinds where collisions are impossible by construction (game turn
//! numbers, session slot indices), and a SHA-1-mixed generator for anything
//! handed out to a client and expected to be unguessable (user IDs, session
//! IDs, tokens).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

pub trait IdGenerator: Send + Sync {
    fn create_id(&self) -> String;
}

/// A plain atomic counter rendered as a decimal string. Good enough for IDs
/// that are never exposed outside a single trusted process.
pub struct NumericalIdGenerator {
    next: AtomicU64,
}

impl NumericalIdGenerator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn starting_at(first: u64) -> Self {
        Self { next: AtomicU64::new(first) }
    }
}

impl Default for NumericalIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for NumericalIdGenerator {
    fn create_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// Seeds a buffer from `/dev/urandom`, falling back to the system clock if
/// the device cannot be read (e.g. in a sandboxed test environment).
fn seed_buffer() -> Vec<u8> {
    use std::io::Read;
    let mut buf = vec![0u8; 20];
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(&mut buf).is_ok() {
            return buf;
        }
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let nanos = now.as_nanos().to_le_bytes();
    for (i, b) in buf.iter_mut().enumerate() {
        *b = nanos[i % nanos.len()];
    }
    buf
}

/// Produces unguessable hex identifiers by repeatedly hashing a mutable
/// internal state buffer. Every call re-hashes the state into itself before
/// emitting the digest, so consecutive IDs from the same generator are
/// unrelated even though they share a seed.
pub struct RandomIdGenerator {
    state: Mutex<Vec<u8>>,
}

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self { state: Mutex::new(seed_buffer()) }
    }
}

impl Default for RandomIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for RandomIdGenerator {
    fn create_id(&self) -> String {
        let mut state = self.state.lock().expect("id generator state poisoned");
        let mut hasher = Sha1::new();
        hasher.update(&*state);
        let digest = hasher.finalize();
        *state = digest.to_vec();
        hex::encode(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numerical_generator_counts_up() {
        let gen = NumericalIdGenerator::starting_at(100);
        assert_eq!(gen.create_id(), "100");
        assert_eq!(gen.create_id(), "101");
    }

    #[test]
    fn random_generator_never_repeats_consecutively() {
        let gen = RandomIdGenerator::new();
        let a = gen.create_id();
        let b = gen.create_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 40);
        assert_eq!(b.len(), 40);
    }

    #[test]
    fn random_generator_instances_do_not_collide() {
        let gen_a = RandomIdGenerator::new();
        let gen_b = RandomIdGenerator::new();
        assert_ne!(gen_a.create_id(), gen_b.create_id());
    }
}
