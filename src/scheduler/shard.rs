//! Seeded deterministic sharding.
//!
//! Used when there is no duration history for a task. The test list is
//! shuffled with a seeded RNG and cut into equal contiguous slices, with
//! the remainder handed out one per fork. Every process that computes the
//! same seed over the same list gets the same partition, so the forks can
//! agree on who runs what without talking to each other.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

use super::{SchedulerError, SchedulerResult};

/// Splits a test list into `fork_count` disjoint, reproducible partitions.
///
/// # Example
///
/// ```
/// use podfork::scheduler::SeededSharder;
///
/// let tests: Vec<String> = ["A", "B", "C", "D", "E", "F", "G"]
///     .iter()
///     .map(|s| s.to_string())
///     .collect();
///
/// let sharder = SeededSharder::new(3, 42)?;
/// let partitions = sharder.partition(&tests);
///
/// assert_eq!(partitions.len(), 3);
/// assert_eq!(partitions.iter().map(Vec::len).sum::<usize>(), 7);
/// assert_eq!(partitions, sharder.partition(&tests));
/// # Ok::<(), podfork::scheduler::SchedulerError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeededSharder {
    fork_count: usize,
    seed: u64,
}

impl SeededSharder {
    /// Creates a sharder for `fork_count` forks.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NoForks`] when `fork_count` is zero.
    pub fn new(fork_count: usize, seed: u64) -> SchedulerResult<Self> {
        if fork_count == 0 {
            return Err(SchedulerError::NoForks);
        }
        Ok(Self { fork_count, seed })
    }

    /// Derives the shuffle seed for one task at one revision.
    ///
    /// `external_seed + hash(task_path) + hash(revision)`, with wrapping
    /// arithmetic and a hash that is stable across builds and platforms.
    pub fn seed_for(external_seed: u64, task_path: &str, revision: &str) -> u64 {
        external_seed
            .wrapping_add(stable_hash(task_path))
            .wrapping_add(stable_hash(revision))
    }

    /// The seed in use.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Partitions `tests` for every fork, in fork order.
    pub fn partition<T: Clone>(&self, tests: &[T]) -> Vec<Vec<T>> {
        let padded = self.shuffled_and_padded(tests);
        (0..self.fork_count)
            .map(|fork| self.slice_for(&padded, tests.len(), fork))
            .collect()
    }

    /// The partition of a single fork.
    ///
    /// Equivalent to `partition(tests)[fork]`; a fork outside the range
    /// receives nothing.
    pub fn fork_partition<T: Clone>(&self, tests: &[T], fork: usize) -> Vec<T> {
        if fork >= self.fork_count {
            return Vec::new();
        }
        let padded = self.shuffled_and_padded(tests);
        self.slice_for(&padded, tests.len(), fork)
    }

    /// Shuffles the real entries, then pads with placeholders (`None`) to a
    /// multiple of the fork count.
    ///
    /// Placeholders go after the shuffle so that they only ever fill the
    /// remainder positions; shuffling them in would let two placeholders
    /// land in the same base slice.
    fn shuffled_and_padded<T: Clone>(&self, tests: &[T]) -> Vec<Option<T>> {
        let mut shuffled: Vec<T> = tests.to_vec();
        shuffled.shuffle(&mut StdRng::seed_from_u64(self.seed));

        let mut padded: Vec<Option<T>> = shuffled.into_iter().map(Some).collect();
        let remainder = padded.len() % self.fork_count;
        if remainder != 0 || padded.is_empty() {
            let target = if padded.is_empty() {
                self.fork_count
            } else {
                padded.len() + self.fork_count - remainder
            };
            padded.resize(target, None);
        }
        padded
    }

    fn slice_for<T: Clone>(&self, padded: &[Option<T>], real_len: usize, fork: usize) -> Vec<T> {
        let per_fork = (real_len / self.fork_count).max(1);
        let consumed = per_fork * self.fork_count;

        let start = (fork * per_fork).min(padded.len());
        let end = ((fork + 1) * per_fork).min(padded.len());

        let mut out: Vec<T> = padded[start..end].iter().flatten().cloned().collect();
        if let Some(Some(extra)) = padded.get(consumed + fork) {
            out.push(extra.clone());
        }
        out
    }
}

/// First eight bytes of the SHA-256 digest, big endian.
pub(crate) fn stable_hash(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("test{}", i)).collect()
    }

    fn assert_complete_and_disjoint(tests: &[String], partitions: &[Vec<String>]) {
        let mut seen = HashSet::new();
        for partition in partitions {
            for test in partition {
                assert!(seen.insert(test.clone()), "{} assigned twice", test);
            }
        }
        let expected: HashSet<String> = tests.iter().cloned().collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_seven_tests_three_forks() {
        let tests: Vec<String> = ["A", "B", "C", "D", "E", "F", "G"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let partitions = SeededSharder::new(3, 42).unwrap().partition(&tests);

        assert_eq!(partitions.len(), 3);
        for partition in &partitions {
            assert!(partition.len() == 2 || partition.len() == 3);
        }
        assert_eq!(partitions.iter().map(Vec::len).sum::<usize>(), 7);
        assert_complete_and_disjoint(&tests, &partitions);
    }

    #[test]
    fn test_complete_and_disjoint_across_shapes() {
        for n in 0..40 {
            for forks in 1..9 {
                let tests = names(n);
                let partitions = SeededSharder::new(forks, n as u64 * 31 + forks as u64)
                    .unwrap()
                    .partition(&tests);
                assert_eq!(partitions.len(), forks);
                assert_complete_and_disjoint(&tests, &partitions);

                let max = partitions.iter().map(Vec::len).max().unwrap_or(0);
                let min = partitions.iter().map(Vec::len).min().unwrap_or(0);
                assert!(max - min <= 1, "unbalanced: {} vs {} for {}/{}", max, min, n, forks);
            }
        }
    }

    #[test]
    fn test_more_forks_than_tests() {
        let tests = names(3);
        let partitions = SeededSharder::new(8, 1).unwrap().partition(&tests);
        assert_eq!(partitions.len(), 8);
        assert!(partitions.iter().all(|p| p.len() <= 1));
        assert_complete_and_disjoint(&tests, &partitions);
    }

    #[test]
    fn test_empty_list() {
        let partitions = SeededSharder::new(4, 1).unwrap().partition::<String>(&[]);
        assert_eq!(partitions.len(), 4);
        assert!(partitions.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_same_seed_same_partition() {
        let tests = names(100);
        let a = SeededSharder::new(7, 99).unwrap().partition(&tests);
        let b = SeededSharder::new(7, 99).unwrap().partition(&tests);
        assert_eq!(a, b);

        let c = SeededSharder::new(7, 100).unwrap().partition(&tests);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fork_partition_matches_partition() {
        let tests = names(23);
        let sharder = SeededSharder::new(5, 3).unwrap();
        let all = sharder.partition(&tests);
        for (fork, expected) in all.iter().enumerate() {
            assert_eq!(&sharder.fork_partition(&tests, fork), expected);
        }
        assert!(sharder.fork_partition(&tests, 5).is_empty());
    }

    #[test]
    fn test_zero_forks_rejected() {
        assert_eq!(SeededSharder::new(0, 1), Err(SchedulerError::NoForks));
    }

    #[test]
    fn test_seed_for_depends_on_inputs() {
        let base = SeededSharder::seed_for(0, ":core:test", "abc123");
        assert_eq!(base, SeededSharder::seed_for(0, ":core:test", "abc123"));
        assert_ne!(base, SeededSharder::seed_for(1, ":core:test", "abc123"));
        assert_ne!(base, SeededSharder::seed_for(0, ":node:test", "abc123"));
        assert_ne!(base, SeededSharder::seed_for(0, ":core:test", "def456"));
    }
}
