//! Explicit random source (spec component C1).
//!
//! The original source (`include/poly/utils.hpp`) exposes a process-wide
//! `RandomGenerator` singleton seeded from the OS entropy device, with
//! `get_random<T>()` and `random_from(vector<T>&)` helpers. Per the
//! REDESIGN FLAGS in spec.md §9 ("Global random singleton... replace with
//! an explicit `Rng` passed through"), `polyforge` never reaches for a
//! global: every caller that needs randomness takes `&mut Rng`.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

/// Draws used, in order, by a single engine run (spec.md §5 "Ordering"):
/// secret iv, secret key, then one `K` per obfuscated instruction, then
/// per-mutation rewrite choice and per-node register/stack coin flips,
/// then the per-instruction NOP coin flip. `Rng` itself doesn't enforce
/// that order — callers do, by construction of the call graph — but it is
/// the reason this type exists as a single threaded-through value instead
/// of ad hoc `rand::thread_rng()` calls scattered through the engine:
/// reproducible builds need one deterministic draw sequence.
pub struct Rng {
    inner: StdRng,
}

impl Rng {
    /// Seeds from the OS entropy device, matching the original's
    /// `std::random_device`-seeded `std::minstd_rand`.
    pub fn from_entropy() -> Rng {
        Rng { inner: StdRng::from_entropy() }
    }

    /// Deterministic seed, for reproducible builds (REDESIGN FLAGS:
    /// "allow callers to... seed deterministically").
    pub fn from_seed(seed: u64) -> Rng {
        Rng { inner: StdRng::seed_from_u64(seed) }
    }

    pub fn random<T>(&mut self) -> T
    where
        rand::distributions::Standard: rand::distributions::Distribution<T>,
    {
        self.inner.gen()
    }

    pub fn random_range(&mut self, low: u64, high_exclusive: u64) -> u64 {
        self.inner.gen_range(low..high_exclusive)
    }

    pub fn random_bool(&mut self) -> bool {
        self.inner.gen()
    }

    /// `random_from` in the original: a uniform pick from a non-empty
    /// slice. Panics on an empty slice, matching the precondition the C++
    /// source never checks either (callers only ever pass non-empty
    /// candidate lists).
    pub fn choose<'a, T>(&mut self, candidates: &'a [T]) -> &'a T {
        let idx = self.random_range(0, candidates.len() as u64) as usize;
        &candidates[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_seed_is_reproducible() {
        let mut a = Rng::from_seed(42);
        let mut b = Rng::from_seed(42);
        let draws_a: Vec<u64> = (0..8).map(|_| a.random_range(0, 1000)).collect();
        let draws_b: Vec<u64> = (0..8).map(|_| b.random_range(0, 1000)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn choose_stays_in_bounds() {
        let mut rng = Rng::from_seed(7);
        let candidates = [1u8, 2, 3, 4];
        for _ in 0..50 {
            assert!(candidates.contains(rng.choose(&candidates)));
        }
    }
}
