//! The shell script exec'd inside every test pod.
//!
//! The script runs in four stages:
//!
//! 1. poll the DNS probe host until the pod has network,
//! 2. `cd` into the source checkout,
//! 3. retry the prepare command until the workspace compiles,
//! 4. run the program once for the fork, then exit with its status after a
//!    short pause that lets the log stream drain.
//!
//! The runner learns which slice of the suite is its own through
//! `-PdockerFork=<i> -PdockerForks=<n>` plus, per task, `--tests <filter>`
//! include filters from the [`ForkPlan`](crate::scheduler::ForkPlan).

use std::fmt;

use tracing::warn;

use crate::config::{Config, Granularity, LogLevel};
use crate::scheduler::ForkAssignment;

const REDACTED: &str = "****";

/// A runner argument whose value must not be logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    value: String,
}

impl Secret {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &REDACTED)
            .finish()
    }
}

/// Reads secret values from the local environment, skipping unset ones.
pub fn resolve_secrets(names: &[String]) -> Vec<Secret> {
    names
        .iter()
        .filter_map(|name| match std::env::var(name) {
            Ok(value) => Some(Secret::new(name.clone(), value)),
            Err(_) => {
                warn!("Secret environment variable {} is not set, skipping", name);
                None
            }
        })
        .collect()
}

/// Builds the per-fork command line.
#[derive(Debug, Clone)]
pub struct BuildCommand {
    pub workdir: String,
    pub program: String,
    pub prepare_command: String,
    pub dns_probe_host: String,
    pub granularity: Granularity,
    pub log_level: LogLevel,
    pub extra_args: Vec<String>,
    pub secrets: Vec<Secret>,
}

impl BuildCommand {
    /// Takes everything from configuration, resolving secrets from the
    /// environment.
    pub fn from_config(config: &Config) -> Self {
        Self {
            workdir: config.runner.workdir.clone(),
            program: config.runner.program.clone(),
            prepare_command: config.runner.prepare_command.clone(),
            dns_probe_host: config.runner.dns_probe_host.clone(),
            granularity: config.distribution.granularity,
            log_level: config.podfork.log_level,
            extra_args: config.runner.extra_args.clone(),
            secrets: resolve_secrets(&config.runner.secret_env),
        }
    }

    /// `["bash", "-c", <script>]` for one fork.
    pub fn argv(&self, fork: &ForkAssignment, fork_count: usize) -> Vec<String> {
        vec![
            "bash".to_string(),
            "-c".to_string(),
            self.script(fork, fork_count, false),
        ]
    }

    /// The script with secret values masked, for logs.
    pub fn redacted(&self, fork: &ForkAssignment, fork_count: usize) -> String {
        self.script(fork, fork_count, true)
    }

    fn script(&self, fork: &ForkAssignment, fork_count: usize, redact: bool) -> String {
        let mut invocation = vec![
            self.program.clone(),
            format!("-Ddistribution={}", self.granularity),
            "-Dkubenetize".to_string(),
            format!("-PdockerFork={}", fork.fork_index),
            format!("-PdockerForks={}", fork_count),
        ];
        for (task, filters) in &fork.filters {
            invocation.push(task.clone());
            for filter in filters {
                invocation.push("--tests".to_string());
                invocation.push(filter.clone());
            }
        }
        invocation.push(self.log_level.runner_flag().to_string());
        invocation.extend(self.extra_args.iter().cloned());
        for secret in &self.secrets {
            let value = if redact { REDACTED } else { secret.value.as_str() };
            invocation.push(format!("-P{}={}", secret.name, value));
        }

        let invocation = shell_words::join(&invocation);
        format!(
            "let x=1 ; while [ ${{x}} -ne 0 ] ; do echo \"Waiting for DNS\" ; curl {probe} > /dev/null 2>&1 ; x=$? ; sleep 1 ; done ; \
             cd {workdir} ; \
             let y=1 ; while [ ${{y}} -ne 0 ] ; do echo \"Preparing build directory\" ; {prepare} 2>&1 ; y=$? ; sleep 1 ; done ; \
             {invocation} 2>&1 ; \
             let rs=$? ; sleep 10 ; exit ${{rs}}",
            probe = shell_words::quote(&self.dns_probe_host),
            workdir = shell_words::quote(&self.workdir),
            prepare = self.prepare_command,
            invocation = invocation,
        )
    }
}
