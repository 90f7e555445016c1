//! Duration-weighted bucketing allocator.
//!
//! Every candidate prefix becomes a [`TestBucket`] weighted by the summed
//! history of the tests it matches. Buckets are then handed out with the
//! greedy Longest-Processing-Time-first heuristic: heaviest bucket first,
//! always onto the currently lightest fork. LPT keeps the makespan within
//! 4/3 of optimal for identical machines.
//!
//! ```text
//!  candidates ──► buckets ──► sort desc ──► lightest slot ──► freeze
//!                (weighted)                  (ties: lowest     (task -> prefixes
//!                                             index)            per fork)
//! ```
//!
//! # Example
//!
//! ```
//! use podfork::durations::{DurationIndex, TestDurations};
//! use podfork::scheduler::{BucketingAllocator, CandidateGroup};
//!
//! let mut durations = TestDurations::new();
//! durations.record_sample("a.SlowTest.one", 30_000_000_000);
//! durations.record_sample("a.FastTest.one", 2_000_000_000);
//! durations.record_sample("a.FastTest.two", 2_000_000_000);
//!
//! let mut allocator = BucketingAllocator::new(2, &durations)?;
//! allocator.add_candidates([
//!     CandidateGroup::new(":core:test", "a.SlowTest"),
//!     CandidateGroup::new(":core:test", "a.FastTest"),
//! ])?;
//! allocator.freeze();
//!
//! assert_eq!(allocator.test_filters(0, ":core:test")?, vec!["a.SlowTest*"]);
//! assert_eq!(allocator.test_filters(1, ":core:test")?, vec!["a.FastTest*"]);
//! # Ok::<(), podfork::scheduler::SchedulerError>(())
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SchedulerError, SchedulerResult};
use crate::durations::DurationIndex;

/// Minimum weight of any bucket, in nanoseconds.
///
/// Tiny or unknown buckets would otherwise all land on one fork.
pub const MIN_BUCKET_DURATION_NANOS: i64 = 1_000_000_000;

/// Appended to every prefix handed to the test runner.
pub const FILTER_WILDCARD: &str = "*";

/// A test-name prefix submitted for a particular execution task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateGroup {
    /// Identifies the task whose runner will execute the matched tests.
    pub task_key: String,
    /// Plain prefix matched against known test identifiers.
    pub name_prefix: String,
}

impl CandidateGroup {
    /// Creates a candidate group.
    pub fn new(task_key: impl Into<String>, name_prefix: impl Into<String>) -> Self {
        Self {
            task_key: task_key.into(),
            name_prefix: name_prefix.into(),
        }
    }
}

/// A weighted group of tests sharing a prefix; the unit of assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestBucket {
    pub task_key: String,
    pub name_prefix: String,
    /// Known tests matching the prefix with their mean durations.
    pub matched_tests: Vec<(String, i64)>,
    /// `max(sum(max(d, 1)), MIN_BUCKET_DURATION_NANOS)`
    pub total_duration_nanos: i64,
}

impl TestBucket {
    /// Builds the bucket for `group` from the duration history.
    ///
    /// A prefix with no history gets a single synthetic entry at the
    /// global mean so it is still scheduled.
    pub fn from_index(group: &CandidateGroup, index: &dyn DurationIndex) -> Self {
        let mut matched = index.lookup(&group.name_prefix);
        if matched.is_empty() {
            matched.push((
                group.name_prefix.clone(),
                index.global_mean_duration_nanos(),
            ));
        }
        Self::with_tests(group.task_key.clone(), group.name_prefix.clone(), matched)
    }

    /// Builds a bucket from an explicit list of matched tests.
    pub fn with_tests(
        task_key: impl Into<String>,
        name_prefix: impl Into<String>,
        matched_tests: Vec<(String, i64)>,
    ) -> Self {
        let summed = matched_tests
            .iter()
            .map(|(_, nanos)| (*nanos).max(1))
            .fold(0i64, i64::saturating_add);

        Self {
            task_key: task_key.into(),
            name_prefix: name_prefix.into(),
            matched_tests,
            total_duration_nanos: summed.max(MIN_BUCKET_DURATION_NANOS),
        }
    }
}

/// One fork's share of the work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForkSlot {
    pub index: usize,
    pub assigned_buckets: Vec<TestBucket>,
    pub cumulative_duration_nanos: i64,
    #[serde(skip)]
    frozen: Option<BTreeMap<String, Vec<String>>>,
}

impl ForkSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    fn assign(&mut self, bucket: TestBucket) {
        self.cumulative_duration_nanos = self
            .cumulative_duration_nanos
            .saturating_add(bucket.total_duration_nanos);
        self.assigned_buckets.push(bucket);
    }

    fn freeze(&mut self) {
        let mut by_task: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for bucket in &self.assigned_buckets {
            by_task
                .entry(bucket.task_key.clone())
                .or_default()
                .push(bucket.name_prefix.clone());
        }
        self.frozen = Some(by_task);
    }

    /// The frozen `task key -> prefixes` lookup, if frozen.
    pub fn prefixes_by_task(&self) -> Option<&BTreeMap<String, Vec<String>>> {
        self.frozen.as_ref()
    }
}

/// Assigns candidate buckets to a fixed number of fork slots.
///
/// The allocator is single-threaded and pure: given the same index
/// contents and candidate order it always produces the same assignment.
pub struct BucketingAllocator<'a> {
    fork_count: usize,
    index: &'a dyn DurationIndex,
    candidates: Vec<CandidateGroup>,
    slots: Vec<ForkSlot>,
    frozen: bool,
}

impl<'a> BucketingAllocator<'a> {
    /// Creates an allocator for `fork_count` forks.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NoForks`] when `fork_count` is zero.
    pub fn new(fork_count: usize, index: &'a dyn DurationIndex) -> SchedulerResult<Self> {
        if fork_count == 0 {
            return Err(SchedulerError::NoForks);
        }
        Ok(Self {
            fork_count,
            index,
            candidates: Vec::new(),
            slots: (0..fork_count).map(ForkSlot::new).collect(),
            frozen: false,
        })
    }

    /// Number of forks being filled.
    pub fn fork_count(&self) -> usize {
        self.fork_count
    }

    /// Adds candidate groups, possibly from several tasks.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::AlreadyFrozen`] once [`freeze`](Self::freeze) ran.
    pub fn add_candidates<I>(&mut self, groups: I) -> SchedulerResult<()>
    where
        I: IntoIterator<Item = CandidateGroup>,
    {
        if self.frozen {
            return Err(SchedulerError::AlreadyFrozen);
        }
        self.candidates.extend(groups);
        Ok(())
    }

    /// Builds buckets and runs the LPT assignment.
    ///
    /// Slots are rebuilt from scratch on every call.
    pub fn allocate(&mut self) {
        if self.frozen {
            return;
        }

        let mut buckets: Vec<TestBucket> = self
            .candidates
            .iter()
            .map(|group| TestBucket::from_index(group, self.index))
            .collect();

        // Stable sort keeps candidate order among equal weights.
        buckets.sort_by(|a, b| b.total_duration_nanos.cmp(&a.total_duration_nanos));

        let mut slots: Vec<ForkSlot> = (0..self.fork_count).map(ForkSlot::new).collect();
        for bucket in buckets {
            // min_by_key returns the first minimum, i.e. the lowest index.
            if let Some(slot) = slots.iter_mut().min_by_key(|s| s.cumulative_duration_nanos) {
                slot.assign(bucket);
            }
        }

        for slot in &slots {
            debug!(
                "Fork {} assigned {} buckets ({} ms expected)",
                slot.index,
                slot.assigned_buckets.len(),
                slot.cumulative_duration_nanos / 1_000_000
            );
        }

        self.slots = slots;
    }

    /// Allocates (if needed) and freezes every slot.
    ///
    /// Calling this more than once yields the same lookups.
    pub fn freeze(&mut self) {
        if self.frozen {
            return;
        }
        self.allocate();
        for slot in &mut self.slots {
            slot.freeze();
        }
        self.frozen = true;
    }

    /// Returns `true` once [`freeze`](Self::freeze) has run.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The fork slots, in index order.
    pub fn slots(&self) -> &[ForkSlot] {
        &self.slots
    }

    /// Include filters for `task_key` on fork `fork_index`.
    ///
    /// Each assigned prefix is returned with [`FILTER_WILDCARD`] appended.
    /// A task with nothing on this fork yields an empty list.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::NotFrozen`] before [`freeze`](Self::freeze)
    /// - [`SchedulerError::ForkOutOfRange`] for an index outside `0..fork_count`
    pub fn test_filters(&self, fork_index: usize, task_key: &str) -> SchedulerResult<Vec<String>> {
        if !self.frozen {
            return Err(SchedulerError::NotFrozen);
        }
        let slot = self
            .slots
            .get(fork_index)
            .ok_or(SchedulerError::ForkOutOfRange {
                index: fork_index,
                fork_count: self.fork_count,
            })?;

        Ok(slot
            .prefixes_by_task()
            .and_then(|by_task| by_task.get(task_key))
            .map(|prefixes| {
                prefixes
                    .iter()
                    .map(|p| format!("{}{}", p, FILTER_WILDCARD))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durations::TestDurations;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SEC: i64 = 1_000_000_000;

    fn index_with(tests: &[(&str, i64)]) -> TestDurations {
        let mut durations = TestDurations::new();
        for (name, nanos) in tests {
            durations.record_sample(name, *nanos);
        }
        durations
    }

    #[test]
    fn test_bucket_floor() {
        let durations = index_with(&[("a.T.x", 5), ("a.T.y", 0)]);
        let bucket = TestBucket::from_index(&CandidateGroup::new("t", "a.T"), &durations);
        assert_eq!(bucket.matched_tests.len(), 2);
        assert_eq!(bucket.total_duration_nanos, MIN_BUCKET_DURATION_NANOS);
    }

    #[test]
    fn test_bucket_zero_durations_count_one_nanosecond() {
        let bucket = TestBucket::with_tests(
            "t",
            "p",
            vec![
                ("a".into(), 0),
                ("b".into(), -4),
                ("c".into(), 2 * SEC),
            ],
        );
        assert_eq!(bucket.total_duration_nanos, 2 * SEC + 2);
    }

    #[test]
    fn test_unmatched_prefix_uses_global_mean() {
        let durations = index_with(&[("a.T.x", 4 * SEC), ("a.T.y", 6 * SEC)]);
        let bucket = TestBucket::from_index(&CandidateGroup::new("t", "b.Unknown"), &durations);
        assert_eq!(
            bucket.matched_tests,
            vec![("b.Unknown".to_string(), 5 * SEC)]
        );
        assert_eq!(bucket.total_duration_nanos, 5 * SEC);
    }

    #[test]
    fn test_lpt_avoids_round_robin_imbalance() {
        let mut tests = vec![("big.T.x".to_string(), 10 * SEC)];
        for i in 0..6 {
            tests.push((format!("small{}.T.x", i), SEC));
        }
        let refs: Vec<(&str, i64)> = tests.iter().map(|(n, d)| (n.as_str(), *d)).collect();
        let durations = index_with(&refs);

        let mut allocator = BucketingAllocator::new(2, &durations).unwrap();
        allocator
            .add_candidates(
                std::iter::once(CandidateGroup::new("t", "big."))
                    .chain((0..6).map(|i| CandidateGroup::new("t", format!("small{}.", i)))),
            )
            .unwrap();
        allocator.freeze();

        let slots = allocator.slots();
        assert_eq!(slots[0].assigned_buckets.len(), 1);
        assert_eq!(slots[0].assigned_buckets[0].name_prefix, "big.");
        assert_eq!(slots[0].cumulative_duration_nanos, 10 * SEC);
        assert_eq!(slots[1].assigned_buckets.len(), 6);
        assert_eq!(slots[1].cumulative_duration_nanos, 6 * SEC);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let durations = TestDurations::new();
        let mut allocator = BucketingAllocator::new(3, &durations).unwrap();
        allocator
            .add_candidates([
                CandidateGroup::new("t", "a"),
                CandidateGroup::new("t", "b"),
                CandidateGroup::new("t", "c"),
                CandidateGroup::new("t", "d"),
            ])
            .unwrap();
        allocator.freeze();

        assert_eq!(allocator.test_filters(0, "t").unwrap(), vec!["a*", "d*"]);
        assert_eq!(allocator.test_filters(1, "t").unwrap(), vec!["b*"]);
        assert_eq!(allocator.test_filters(2, "t").unwrap(), vec!["c*"]);
    }

    #[test]
    fn test_filters_before_freeze() {
        let durations = TestDurations::new();
        let allocator = BucketingAllocator::new(2, &durations).unwrap();
        assert_eq!(
            allocator.test_filters(0, "t").unwrap_err(),
            SchedulerError::NotFrozen
        );
    }

    #[test]
    fn test_filters_fork_out_of_range() {
        let durations = TestDurations::new();
        let mut allocator = BucketingAllocator::new(2, &durations).unwrap();
        allocator.freeze();
        assert_eq!(
            allocator.test_filters(2, "t").unwrap_err(),
            SchedulerError::ForkOutOfRange {
                index: 2,
                fork_count: 2
            }
        );
    }

    #[test]
    fn test_zero_forks_rejected() {
        let durations = TestDurations::new();
        assert_eq!(
            BucketingAllocator::new(0, &durations).err(),
            Some(SchedulerError::NoForks)
        );
    }

    #[test]
    fn test_add_after_freeze_rejected() {
        let durations = TestDurations::new();
        let mut allocator = BucketingAllocator::new(1, &durations).unwrap();
        allocator.freeze();
        assert_eq!(
            allocator.add_candidates([CandidateGroup::new("t", "a")]),
            Err(SchedulerError::AlreadyFrozen)
        );
    }

    #[test]
    fn test_multiple_tasks_share_slots() {
        let durations = index_with(&[("a.X.1", 8 * SEC), ("b.Y.1", 5 * SEC), ("b.Z.1", 4 * SEC)]);
        let mut allocator = BucketingAllocator::new(2, &durations).unwrap();
        allocator
            .add_candidates([
                CandidateGroup::new(":a:test", "a.X"),
                CandidateGroup::new(":b:integrationTest", "b.Y"),
                CandidateGroup::new(":b:integrationTest", "b.Z"),
            ])
            .unwrap();
        allocator.freeze();

        assert_eq!(allocator.test_filters(0, ":a:test").unwrap(), vec!["a.X*"]);
        assert!(allocator.test_filters(0, ":b:integrationTest").unwrap().is_empty());
        assert_eq!(
            allocator.test_filters(1, ":b:integrationTest").unwrap(),
            vec!["b.Y*", "b.Z*"]
        );
    }

    #[test]
    fn test_idempotent_freeze() {
        let durations = index_with(&[("a.X.1", 3 * SEC), ("a.Y.1", 2 * SEC)]);
        let mut allocator = BucketingAllocator::new(2, &durations).unwrap();
        allocator
            .add_candidates([CandidateGroup::new("t", "a.X"), CandidateGroup::new("t", "a.Y")])
            .unwrap();

        allocator.freeze();
        let first: Vec<_> = allocator
            .slots()
            .iter()
            .map(|s| s.prefixes_by_task().cloned())
            .collect();
        allocator.freeze();
        let second: Vec<_> = allocator
            .slots()
            .iter()
            .map(|s| s.prefixes_by_task().cloned())
            .collect();

        assert_eq!(first, second);
        assert!(first.iter().all(|m| m.is_some()));
    }

    #[test]
    fn test_deterministic_assignment() {
        let durations = index_with(&[("p1.a", 3 * SEC), ("p2.a", 3 * SEC), ("p3.a", 2 * SEC)]);
        let groups = || {
            vec![
                CandidateGroup::new("t", "p1"),
                CandidateGroup::new("t", "p2"),
                CandidateGroup::new("t", "p3"),
            ]
        };

        let run = || {
            let mut allocator = BucketingAllocator::new(2, &durations).unwrap();
            allocator.add_candidates(groups()).unwrap();
            allocator.freeze();
            (0..2)
                .map(|f| allocator.test_filters(f, "t").unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(), run());
        assert_eq!(run()[0], vec!["p1*", "p3*"]);
    }

    /// Smallest achievable makespan, by exhaustive search.
    fn optimal_makespan(weights: &[i64], forks: usize) -> i64 {
        fn search(weights: &[i64], loads: &mut Vec<i64>, best: &mut i64) {
            let Some((first, rest)) = weights.split_first() else {
                let makespan = loads.iter().copied().max().unwrap_or(0);
                *best = (*best).min(makespan);
                return;
            };
            for i in 0..loads.len() {
                loads[i] += first;
                if loads[i] < *best {
                    search(rest, loads, best);
                }
                loads[i] -= first;
            }
        }

        let mut best = i64::MAX;
        search(weights, &mut vec![0; forks], &mut best);
        best
    }

    #[test]
    fn test_lpt_within_four_thirds_of_optimal() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let forks = rng.gen_range(1..=3);
            let bucket_count = rng.gen_range(1..=7);
            let tests: Vec<(String, i64)> = (0..bucket_count)
                .map(|i| (format!("b{}.T.x", i), rng.gen_range(1..=20) * SEC))
                .collect();
            let refs: Vec<(&str, i64)> = tests.iter().map(|(n, d)| (n.as_str(), *d)).collect();
            let durations = index_with(&refs);

            let mut allocator = BucketingAllocator::new(forks, &durations).unwrap();
            allocator
                .add_candidates((0..bucket_count).map(|i| CandidateGroup::new("t", format!("b{}.", i))))
                .unwrap();
            allocator.freeze();

            let weights: Vec<i64> = allocator
                .slots()
                .iter()
                .flat_map(|s| s.assigned_buckets.iter().map(|b| b.total_duration_nanos))
                .collect();
            assert_eq!(weights.len(), bucket_count);

            let lpt = allocator
                .slots()
                .iter()
                .map(|s| s.cumulative_duration_nanos)
                .max()
                .unwrap();
            let optimal = optimal_makespan(&weights, forks);

            assert!(
                3 * lpt <= 4 * optimal,
                "LPT makespan {} exceeds 4/3 of optimal {} for {:?} on {} forks",
                lpt,
                optimal,
                weights,
                forks
            );
        }
    }
}
