//! podfork: distributed JVM test execution on Kubernetes.
//!
//! A suite is split across N forks, each fork runs in its own pod, and the
//! results are collected back onto the local machine.
//!
//! # Architecture
//!
//! - **Durations**: history of test run times ([`durations`])
//! - **Scheduler**: decides which tests each fork runs ([`scheduler`])
//! - **Cluster**: the Kubernetes operations the run needs ([`cluster`])
//! - **Orchestrator**: drives every fork's pod and aggregates ([`orchestrator`])
//! - **Report**: console and JSON output ([`report`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use podfork::cluster::kubectl::KubectlCluster;
//! use podfork::command::BuildCommand;
//! use podfork::config::load_config;
//! use podfork::durations::TestDurations;
//! use podfork::identity::{RunIdentity, task_path};
//! use podfork::orchestrator::{
//!     CleanupRegistry, Orchestrator, RetryPolicy, WorkerLifecycle, WorkerSettings,
//! };
//! use podfork::scheduler::{CandidateGroup, ShardSeed, plan_forks};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("podfork.toml"))?;
//!     let durations = TestDurations::load_or_empty(&config.distribution.durations_file);
//!     let candidates = vec![CandidateGroup::new(":core:test", "net.corda.core")];
//!     let plan = plan_forks(config.podfork.fork_count, &durations, &candidates, &ShardSeed::default())?;
//!
//!     let cluster = Arc::new(KubectlCluster::new("kubectl", &config.cluster.namespace));
//!     let task = task_path(candidates.iter().map(|c| c.task_key.as_str()));
//!     let identity = RunIdentity::from_environment(&task, None);
//!     let lifecycle = WorkerLifecycle::new(
//!         cluster.clone(),
//!         identity.clone(),
//!         WorkerSettings::from_config(&config),
//!         BuildCommand::from_config(&config),
//!         CleanupRegistry::new(),
//!         RetryPolicy::fixed(config.podfork.retry_attempts),
//!     );
//!     let report = Orchestrator::new(cluster, identity, lifecycle).run(&plan).await;
//!     report.ensure_success()?;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod command;
pub mod config;
pub mod durations;
pub mod identity;
pub mod orchestrator;
pub mod report;
pub mod scheduler;

pub use config::{Config, load_config};
pub use durations::{DurationIndex, TestDurations};
pub use orchestrator::{Orchestrator, RunReport};
pub use scheduler::{ForkPlan, plan_forks};
