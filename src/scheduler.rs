//! Test distribution across forks.
//!
//! Two strategies split work between the forks:
//!
//! | Strategy | Module | Used when |
//! |----------|--------|-----------|
//! | Duration-weighted bucketing (LPT) | [`bucketing`] | the task has duration history |
//! | Seeded sharding | [`shard`] | the task has no history (cold start) |
//!
//! [`plan_forks`] picks the strategy per task and merges the outcome into a
//! single [`ForkPlan`]: for every fork, the include filters each task's
//! runner should receive. Planning is synchronous and finishes before any
//! pod is requested.
//!
//! # Example
//!
//! ```
//! use podfork::durations::TestDurations;
//! use podfork::scheduler::{plan_forks, CandidateGroup, ShardSeed};
//!
//! let durations = TestDurations::new(); // cold start: no history
//! let candidates = vec![
//!     CandidateGroup::new(":core:test", "net.corda.core.FooTest"),
//!     CandidateGroup::new(":core:test", "net.corda.core.BarTest"),
//! ];
//!
//! let plan = plan_forks(2, &durations, &candidates, &ShardSeed::default())?;
//! assert_eq!(plan.fork_count(), 2);
//! assert_eq!(plan.total_filters(), 2);
//! # Ok::<(), podfork::scheduler::SchedulerError>(())
//! ```

pub mod bucketing;
pub mod shard;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::durations::DurationIndex;

pub use bucketing::{BucketingAllocator, CandidateGroup, FILTER_WILDCARD, ForkSlot, TestBucket};
pub use shard::SeededSharder;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Precondition violations when querying an allocation.
///
/// These are programming errors, raised synchronously.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Filters were requested before the allocation was frozen.
    #[error("Test filters requested before the allocation was frozen")]
    NotFrozen,

    /// Fork index outside `0..fork_count`.
    #[error("Fork index {index} is outside 0..{fork_count}")]
    ForkOutOfRange { index: usize, fork_count: usize },

    /// Candidates were added after the allocation was frozen.
    #[error("Allocation is frozen; no more candidates can be added")]
    AlreadyFrozen,

    /// Work was to be split across zero forks.
    #[error("Fork count must be at least 1")]
    NoForks,

    /// A candidate line names no task and no default task was given.
    #[error("Line {line}: '{prefix}' has no task and no default task was given")]
    MissingTask { line: usize, prefix: String },
}

/// Inputs to the seed of cold-start sharding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardSeed {
    /// Seed supplied by the caller (configuration or CLI).
    pub external: u64,
    /// Source revision under test, so a new commit reshuffles.
    pub revision: String,
}

/// What one fork has to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForkAssignment {
    pub fork_index: usize,
    /// Include filters per task key, in task-key order.
    pub filters: BTreeMap<String, Vec<String>>,
    /// Expected run time from history; zero for sharded work.
    pub expected_duration_nanos: i64,
}

impl ForkAssignment {
    /// Returns `true` if no task has anything to run on this fork.
    pub fn is_empty(&self) -> bool {
        self.filters.values().all(Vec::is_empty)
    }

    /// Number of filters across all tasks.
    pub fn filter_count(&self) -> usize {
        self.filters.values().map(Vec::len).sum()
    }
}

/// The frozen distribution of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForkPlan {
    forks: Vec<ForkAssignment>,
}

impl ForkPlan {
    /// Number of forks in the plan.
    pub fn fork_count(&self) -> usize {
        self.forks.len()
    }

    /// All fork assignments in fork order.
    pub fn forks(&self) -> &[ForkAssignment] {
        &self.forks
    }

    /// The assignment of one fork.
    pub fn fork(&self, index: usize) -> SchedulerResult<&ForkAssignment> {
        self.forks.get(index).ok_or(SchedulerError::ForkOutOfRange {
            index,
            fork_count: self.forks.len(),
        })
    }

    /// Number of filters across all forks.
    pub fn total_filters(&self) -> usize {
        self.forks.iter().map(ForkAssignment::filter_count).sum()
    }
}

/// Builds the per-fork include filters for a set of candidates.
///
/// Tasks where at least one prefix matches duration history are allocated
/// together by the [`BucketingAllocator`]. The remaining tasks are sharded
/// independently by [`SeededSharder`], seeded per task.
///
/// # Errors
///
/// [`SchedulerError::NoForks`] when `fork_count` is zero.
pub fn plan_forks(
    fork_count: usize,
    index: &dyn DurationIndex,
    candidates: &[CandidateGroup],
    seed: &ShardSeed,
) -> SchedulerResult<ForkPlan> {
    if fork_count == 0 {
        return Err(SchedulerError::NoForks);
    }
    let mut forks: Vec<ForkAssignment> = (0..fork_count)
        .map(|fork_index| ForkAssignment {
            fork_index,
            ..Default::default()
        })
        .collect();

    // Task keys in first-seen order, with their prefixes.
    let mut tasks: Vec<(&str, Vec<&CandidateGroup>)> = Vec::new();
    for group in candidates {
        match tasks.iter_mut().find(|(key, _)| *key == group.task_key) {
            Some((_, groups)) => groups.push(group),
            None => tasks.push((group.task_key.as_str(), vec![group])),
        }
    }

    let (with_history, cold): (Vec<_>, Vec<_>) = tasks.into_iter().partition(|(_, groups)| {
        !index.is_empty()
            && groups
                .iter()
                .any(|g| !index.lookup(&g.name_prefix).is_empty())
    });

    if !with_history.is_empty() {
        let mut allocator = BucketingAllocator::new(fork_count, index)?;
        allocator.add_candidates(
            with_history
                .iter()
                .flat_map(|(_, groups)| groups.iter().map(|g| (*g).clone())),
        )?;
        allocator.freeze();

        for (fork, slot) in forks.iter_mut().zip(allocator.slots()) {
            fork.expected_duration_nanos = slot.cumulative_duration_nanos;
            for (task_key, _) in &with_history {
                if let Ok(filters) = allocator.test_filters(fork.fork_index, task_key)
                    && !filters.is_empty()
                {
                    fork.filters.insert(task_key.to_string(), filters);
                }
            }
        }

        info!(
            "Allocated {} tasks by duration history across {} forks",
            with_history.len(),
            fork_count
        );
    }

    for (task_key, groups) in &cold {
        let sharder = SeededSharder::new(
            fork_count,
            SeededSharder::seed_for(seed.external, task_key, &seed.revision),
        )?;
        let prefixes: Vec<&str> = groups.iter().map(|g| g.name_prefix.as_str()).collect();

        for (fork, partition) in forks.iter_mut().zip(sharder.partition(&prefixes)) {
            if partition.is_empty() {
                continue;
            }
            fork.filters.insert(
                task_key.to_string(),
                partition
                    .into_iter()
                    .map(|p| format!("{}{}", p, FILTER_WILDCARD))
                    .collect(),
            );
        }

        info!(
            "No duration history for {}, sharded {} candidates with seed {}",
            task_key,
            prefixes.len(),
            sharder.seed()
        );
    }

    Ok(ForkPlan { forks })
}

/// Parses a candidate list.
///
/// One entry per line: `task_key<TAB>name_prefix`, or a bare prefix that
/// belongs to `default_task`. Blank lines and lines starting with `#` are
/// skipped.
pub fn parse_candidates(
    content: &str,
    default_task: Option<&str>,
) -> SchedulerResult<Vec<CandidateGroup>> {
    let mut candidates = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let group = match line.split_once('\t') {
            Some((task, prefix)) => CandidateGroup::new(task.trim(), prefix.trim()),
            None => match default_task {
                Some(task) => CandidateGroup::new(task, line),
                None => {
                    return Err(SchedulerError::MissingTask {
                        line: number + 1,
                        prefix: line.to_string(),
                    });
                }
            },
        };
        candidates.push(group);
    }
    Ok(candidates)
}
