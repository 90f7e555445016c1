//! Configuration loading for podfork.
//!
//! Configuration is a TOML file; see [`schema`] for every section and its
//! defaults. Paths (`output_dir`, `durations_file`) go through `~` and
//! environment-variable expansion after parsing.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Loads configuration from a TOML file.
///
/// # Example
///
/// ```no_run
/// use podfork::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("podfork.toml"))?;
/// println!("Forks: {}", config.podfork.fork_count);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config.expanded()
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use podfork::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [podfork]
///     fork_count = 4
///
///     [cluster]
///     image = "registry/tests:latest"
/// "#)?;
///
/// assert_eq!(config.podfork.fork_count, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    config.expanded()
}

impl Config {
    fn expanded(mut self) -> Result<Self> {
        self.podfork.output_dir = expand_path(&self.podfork.output_dir)?;
        self.distribution.durations_file = expand_path(&self.distribution.durations_file)?;
        Ok(self)
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.podfork.fork_count == 0 {
            bail!("podfork.fork_count must be at least 1");
        }
        if self.podfork.retry_attempts == 0 {
            bail!("podfork.retry_attempts must be at least 1");
        }
        if self.cluster.image.trim().is_empty() {
            bail!("cluster.image must not be empty");
        }
        if self.cluster.namespace.trim().is_empty() {
            bail!("cluster.namespace must not be empty");
        }
        if self.cluster.cpu_per_fork == 0 || self.cluster.memory_gb_per_fork == 0 {
            bail!("cluster.cpu_per_fork and cluster.memory_gb_per_fork must be positive");
        }
        if self.cluster.pod_start_timeout_secs == 0 {
            bail!("cluster.pod_start_timeout_secs must be positive");
        }
        if !self.runner.workdir.starts_with('/') {
            bail!(
                "runner.workdir must be an absolute path inside the image, got '{}'",
                self.runner.workdir
            );
        }
        for name in &self.runner.secret_env {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                bail!("runner.secret_env entry '{}' is not a valid variable name", name);
            }
        }
        Ok(())
    }

    /// Number of placeholder pods the pre-warm pool requests.
    pub fn prewarm_pods(&self) -> usize {
        if self.prewarm.pods == 0 {
            self.podfork.fork_count
        } else {
            self.prewarm.pods
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [cluster]
        image = "registry/tests:1"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = load_config_str(MINIMAL).unwrap();

        assert_eq!(config.podfork.fork_count, 20);
        assert_eq!(config.podfork.retry_attempts, 3);
        assert_eq!(config.podfork.log_level, LogLevel::Info);
        assert!(!config.podfork.echo_output);
        assert_eq!(config.cluster.cpu_per_fork, 4);
        assert_eq!(config.cluster.memory_gb_per_fork, 6);
        assert_eq!(config.cluster.pod_start_timeout_secs, 3600);
        assert_eq!(config.cluster.image_pull_secret, "regcred");
        assert_eq!(config.distribution.granularity, Granularity::Method);
        assert_eq!(config.runner.workdir, "/tmp/source");
        assert_eq!(config.prewarm.timeout_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = load_config_str(
            r#"
            [podfork]
            fork_count = 8
            log_level = "QUIET"
            echo_output = true

            [cluster]
            namespace = "ci"
            image = "registry/tests:1"
            tolerations = [{ key = "tests", value = "true", effect = "NoSchedule" }]
            node_selector = { pool = "tests" }

            [distribution]
            granularity = "CLASS"
            seed = 7
            revision = "abc123"

            [runner]
            extra_args = ["--stacktrace"]
            secret_env = ["ARTIFACTORY_PASSWORD"]

            [prewarm]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.podfork.fork_count, 8);
        assert_eq!(config.podfork.log_level, LogLevel::Quiet);
        assert_eq!(config.cluster.tolerations[0].key, "tests");
        assert_eq!(config.cluster.node_selector["pool"], "tests");
        assert_eq!(config.distribution.granularity, Granularity::Class);
        assert_eq!(config.distribution.seed, 7);
        assert_eq!(config.runner.secret_env, vec!["ARTIFACTORY_PASSWORD"]);
        assert_eq!(config.prewarm_pods(), 8);
    }

    #[test]
    fn test_missing_image_is_an_error() {
        assert!(load_config_str("[podfork]\nfork_count = 2\n").is_err());
    }

    #[test]
    fn test_unknown_log_level_is_an_error() {
        let result = load_config_str(
            r#"
            [podfork]
            log_level = "VERBOSE"
            [cluster]
            image = "x"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_forks() {
        let mut config = load_config_str(MINIMAL).unwrap();
        config.podfork.fork_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_secret_name() {
        let mut config = load_config_str(MINIMAL).unwrap();
        config.runner.secret_env = vec!["NOT VALID".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(LogLevel::Quiet.directive(), "error");
        assert_eq!(LogLevel::Debug.runner_flag(), "--debug");
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podfork.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.cluster.image, "registry/tests:1");
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
