//! Run identity and resource naming.
//!
//! A run is identified by two parts:
//!
//! - a **stable id**, derived from build id, user and task path. Re-running
//!   the same build produces the same id, which is how leftovers from an
//!   earlier attempt are found and deleted.
//! - a **random suffix**, fresh per process, so a rerun never collides with
//!   pods that are still terminating.
//!
//! Pod names are `<task>-<stable><suffix>-<fork>`, sanitised to a DNS-1123
//! label of at most 63 characters. Truncation eats the task part first and
//! never touches the fork index.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::scheduler::shard::stable_hash;

/// Longest name Kubernetes accepts for a DNS-1123 label.
pub const MAX_NAME_LEN: usize = 63;

/// Label key carrying the stable id on every resource of a run.
pub const RUN_LABEL: &str = "podfork/run";

static INVALID_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").ok());

/// Identity of one distributed test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    task: String,
    stable_id: String,
    random_suffix: String,
}

impl RunIdentity {
    /// Creates an identity with a fresh random suffix.
    pub fn new(build_id: &str, user: &str, task: &str) -> Self {
        Self::with_suffix(build_id, user, task, base36(rand::random::<u64>()))
    }

    /// Creates an identity with a caller-chosen suffix.
    pub fn with_suffix(build_id: &str, user: &str, task: &str, suffix: impl Into<String>) -> Self {
        let seed = format!("{}\u{0}{}\u{0}{}", build_id, user, task);
        Self {
            task: task.to_string(),
            stable_id: base36(stable_hash(&seed)),
            random_suffix: sanitize(&suffix.into()),
        }
    }

    /// Reads build id and user from the environment.
    ///
    /// `build_id` wins over `BUILD_ID`; both fall back to `"0"`. The user
    /// comes from `USER` or `USERNAME`.
    pub fn from_environment(task: &str, build_id: Option<&str>) -> Self {
        let build_id = build_id
            .map(str::to_string)
            .or_else(|| std::env::var("BUILD_ID").ok())
            .unwrap_or_else(|| "0".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "UNKNOWN_USER".to_string());
        Self::new(&build_id, &user, task)
    }

    pub fn stable_id(&self) -> &str {
        &self.stable_id
    }

    pub fn random_suffix(&self) -> &str {
        &self.random_suffix
    }

    /// Name of the pod for one fork.
    pub fn pod_name(&self, fork: usize) -> String {
        let tail = format!("-{}", fork);
        let budget = MAX_NAME_LEN - tail.len();

        let id = format!("{}{}", self.stable_id, self.random_suffix);
        let id = &id[..id.len().min(budget)];

        let task_budget = budget.saturating_sub(id.len() + 1);
        let task = sanitize(&self.task);
        let task = task[..task.len().min(task_budget)].trim_end_matches('-');

        if task.is_empty() {
            format!("{}{}", id, tail)
        } else {
            format!("{}-{}{}", task, id, tail)
        }
    }

    /// Name of the volume claim for one fork.
    pub fn claim_name(&self, fork: usize) -> String {
        self.pod_name(fork)
    }

    /// Name of the pre-warm job.
    pub fn prewarm_job_name(&self) -> String {
        format!("prewarm-{}{}", self.stable_id, self.random_suffix)
    }

    /// Whether a resource name belongs to any run with this stable id.
    pub fn owns(&self, name: &str) -> bool {
        name.contains(&self.stable_id)
    }
}

/// The task path a run is identified by: its distinct task keys, sorted
/// and joined with `+`.
///
/// Two runs of different tasks never share a stable id, whatever order the
/// tasks were listed in.
///
/// ```
/// use podfork::identity::task_path;
///
/// assert_eq!(task_path([":node:test", ":core:test", ":node:test"]), ":core:test+:node:test");
/// ```
pub fn task_path<'a>(task_keys: impl IntoIterator<Item = &'a str>) -> String {
    let keys: BTreeSet<&str> = task_keys
        .into_iter()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .collect();
    keys.into_iter().collect::<Vec<_>>().join("+")
}

/// Lowercases and replaces anything outside `[a-z0-9]` with single dashes.
fn sanitize(value: &str) -> String {
    let lower = value.to_lowercase();
    let replaced = match INVALID_CHARS.as_ref() {
        Some(re) => re.replace_all(&lower, "-").into_owned(),
        None => lower,
    };
    replaced.trim_matches('-').to_string()
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
