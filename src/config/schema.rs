//! Configuration schema definitions for podfork.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── PodforkConfig        - Fork count, retries, logging, output directory
//! ├── ClusterConfig        - Namespace, image, per-fork resources, scheduling
//! ├── DistributionConfig   - Granularity, shard seed, duration store
//! ├── RunnerConfig         - What gets exec'd inside each pod
//! └── PrewarmConfig        - Optional capacity reservation before the run
//! ```
//!
//! Every field except `cluster.image` has a default.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cluster::Toleration;

/// Root configuration structure.
///
/// # Example
///
/// ```
/// use podfork::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [cluster]
///     image = "registry/tests:latest"
/// "#).unwrap();
///
/// assert_eq!(config.podfork.fork_count, 20);
/// assert_eq!(config.cluster.namespace, "thisisatest");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub podfork: PodforkConfig,

    pub cluster: ClusterConfig,

    #[serde(default)]
    pub distribution: DistributionConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub prewarm: PrewarmConfig,
}

/// Core run settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `fork_count` | 20 |
/// | `retry_attempts` | 3 |
/// | `log_level` | `INFO` |
/// | `echo_output` | false |
/// | `output_dir` | `build` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PodforkConfig {
    /// Number of pods the suite is spread over.
    #[serde(default = "default_fork_count")]
    pub fork_count: usize,

    /// Attempts per fork, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Echo container output to the console as `Container<i>: <line>`.
    #[serde(default)]
    pub echo_output: bool,

    /// Root for collected results, logs and the run summary.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Build id folded into the stable run id. Falls back to `BUILD_ID`.
    #[serde(default)]
    pub build_id: Option<String>,
}

impl Default for PodforkConfig {
    fn default() -> Self {
        Self {
            fork_count: default_fork_count(),
            retry_attempts: default_retry_attempts(),
            log_level: LogLevel::default(),
            echo_output: false,
            output_dir: default_output_dir(),
            build_id: None,
        }
    }
}

fn default_fork_count() -> usize {
    20
}

fn default_retry_attempts() -> usize {
    3
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("build")
}

/// Verbosity of both podfork and the runner inside the pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Quiet,
    Debug,
}

impl LogLevel {
    /// `tracing` filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Quiet => "error",
            LogLevel::Debug => "debug",
        }
    }

    /// Flag handed to the runner.
    pub fn runner_flag(self) -> &'static str {
        match self {
            LogLevel::Info => "--info",
            LogLevel::Warn => "--warn",
            LogLevel::Quiet => "--quiet",
            LogLevel::Debug => "--debug",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "QUIET" => Ok(LogLevel::Quiet),
            "DEBUG" => Ok(LogLevel::Debug),
            other => Err(format!(
                "unknown log level '{}', expected INFO, WARN, QUIET or DEBUG",
                other
            )),
        }
    }
}

/// Cluster placement and per-fork resources.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Container image holding the prepared source tree.
    pub image: String,

    /// Secret used to pull `image`. Empty disables it.
    #[serde(default = "default_image_pull_secret")]
    pub image_pull_secret: String,

    #[serde(default = "default_cpu_per_fork")]
    pub cpu_per_fork: u32,

    #[serde(default = "default_memory_gb_per_fork")]
    pub memory_gb_per_fork: u32,

    /// How long a pod may take to become ready.
    #[serde(default = "default_pod_start_timeout")]
    pub pod_start_timeout_secs: u64,

    /// Host directory shared by pods on a node as the build cache.
    #[serde(default = "default_host_cache_dir")]
    pub host_cache_dir: String,

    /// Storage requested for each fork's report volume.
    #[serde(default = "default_results_claim_size")]
    pub results_claim_size: String,

    /// Path to the kubectl binary.
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// Kubeconfig context; the current context when unset.
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

fn default_namespace() -> String {
    "thisisatest".to_string()
}

fn default_image_pull_secret() -> String {
    "regcred".to_string()
}

fn default_cpu_per_fork() -> u32 {
    4
}

fn default_memory_gb_per_fork() -> u32 {
    6
}

fn default_pod_start_timeout() -> u64 {
    3600
}

fn default_host_cache_dir() -> String {
    "/tmp/gradle".to_string()
}

fn default_results_claim_size() -> String {
    "100Mi".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

/// Unit of distribution passed to the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Class,
    #[default]
    Method,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Class => f.write_str("CLASS"),
            Granularity::Method => f.write_str("METHOD"),
        }
    }
}

/// How tests are split between forks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub granularity: Granularity,

    /// External part of the cold-start shuffle seed.
    #[serde(default)]
    pub seed: u64,

    /// Source revision folded into the shuffle seed.
    #[serde(default)]
    pub revision: String,

    /// CSV duration store.
    #[serde(default = "default_durations_file")]
    pub durations_file: PathBuf,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            seed: 0,
            revision: String::new(),
            durations_file: default_durations_file(),
        }
    }
}

fn default_durations_file() -> PathBuf {
    PathBuf::from("tests-durations.csv")
}

/// The build command exec'd in every pod.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Source checkout inside the image.
    #[serde(default = "default_workdir")]
    pub workdir: String,

    #[serde(default = "default_program")]
    pub program: String,

    /// Retried until it succeeds before the tests start.
    #[serde(default = "default_prepare_command")]
    pub prepare_command: String,

    /// Host polled until DNS works inside the pod.
    #[serde(default = "default_dns_probe_host")]
    pub dns_probe_host: String,

    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment variables passed to the runner as `-P<NAME>=<value>`.
    /// Their values never appear in logs.
    #[serde(default)]
    pub secret_env: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            program: default_program(),
            prepare_command: default_prepare_command(),
            dns_probe_host: default_dns_probe_host(),
            extra_args: Vec::new(),
            secret_env: Vec::new(),
        }
    }
}

fn default_workdir() -> String {
    "/tmp/source".to_string()
}

fn default_program() -> String {
    "./gradlew".to_string()
}

fn default_prepare_command() -> String {
    "./gradlew testClasses integrationTestClasses --parallel".to_string()
}

fn default_dns_probe_host() -> String {
    "services.gradle.org".to_string()
}

/// Capacity reservation ahead of the run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrewarmConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Placeholder pods; `0` means one per fork.
    #[serde(default)]
    pub pods: usize,

    /// How long to wait for the placeholders to disappear on tear-down.
    #[serde(default = "default_prewarm_timeout")]
    pub timeout_secs: u64,
}

impl Default for PrewarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pods: 0,
            timeout_secs: default_prewarm_timeout(),
        }
    }
}

fn default_prewarm_timeout() -> u64 {
    600
}
