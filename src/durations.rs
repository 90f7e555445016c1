//! Historical test durations.
//!
//! The allocator weighs every test by how long it took in previous runs.
//! This module holds that history behind the [`DurationIndex`] trait so the
//! scheduler never reaches for global state: the caller loads an index and
//! passes it in.
//!
//! # Storage Format
//!
//! The on-disk store is the CSV artifact produced by earlier runs:
//!
//! ```text
//! Test Name,Mean Duration (nanos),Runs
//! net.corda.core.FooTest.testBar,1532000000,12
//! net.corda.core.FooTest.testBaz,20000000,3
//! ```
//!
//! A missing or unreadable store is never fatal. [`TestDurations::load_or_empty`]
//! logs a warning and returns an empty index, which makes the planner fall
//! back to seeded sharding.
//!
//! # Example
//!
//! ```
//! use podfork::durations::{DurationIndex, TestDurations};
//!
//! let mut durations = TestDurations::new();
//! durations.record_sample("net.corda.FooTest.testA", 2_000);
//! durations.record_sample("net.corda.FooTest.testB", 4_000);
//! durations.record_sample("net.corda.BarTest.testC", 9_000);
//!
//! let matched = durations.lookup("net.corda.FooTest");
//! assert_eq!(matched.len(), 2);
//! assert_eq!(durations.global_mean_duration_nanos(), 5_000);
//! ```

pub mod junit;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Header line of the CSV duration store.
pub const CSV_HEADER: &str = "Test Name,Mean Duration (nanos),Runs";

/// Mean used when the index holds no history at all.
pub const FALLBACK_MEAN_NANOS: i64 = 1_000_000_000;

/// Result type for duration store operations.
pub type DurationsResult<T> = Result<T, DurationsError>;

/// Errors raised while reading or writing the duration store.
#[derive(Debug, thiserror::Error)]
pub enum DurationsError {
    /// Reading or writing the store failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A CSV line could not be parsed.
    #[error("Malformed duration record on line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A JUnit XML file could not be parsed.
    #[error("Malformed JUnit XML in {path}: {message}")]
    Xml { path: String, message: String },
}

/// Running mean of a single test's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationSample {
    /// Mean execution time in nanoseconds.
    pub mean_nanos: i64,
    /// Number of runs folded into the mean.
    pub run_count: i64,
}

impl DurationSample {
    /// Creates a sample from a single observation.
    pub fn new(duration_nanos: i64) -> Self {
        Self {
            mean_nanos: duration_nanos,
            run_count: 1,
        }
    }

    /// Folds one more observation into the running mean.
    ///
    /// `new_mean = (old_mean * old_count + sample) / (old_count + 1)`
    pub fn record(&mut self, duration_nanos: i64) {
        // i128 keeps mean * count from overflowing for long-lived entries
        let total = i128::from(self.mean_nanos) * i128::from(self.run_count)
            + i128::from(duration_nanos);
        self.run_count += 1;
        self.mean_nanos = (total / i128::from(self.run_count)) as i64;
    }
}

/// Lookup of historical durations by test name prefix.
///
/// Implementations must be cheap to query: the allocator calls
/// [`lookup`](Self::lookup) once per candidate prefix.
pub trait DurationIndex: Send + Sync {
    /// Returns every known test whose identifier starts with `prefix`,
    /// paired with its mean duration in nanoseconds.
    ///
    /// This is a plain string prefix match, not a pattern.
    fn lookup(&self, prefix: &str) -> Vec<(String, i64)>;

    /// Mean duration across all known tests, used for unseen tests.
    fn global_mean_duration_nanos(&self) -> i64;

    /// Folds a new observation for `test_id` into the history.
    fn record_sample(&mut self, test_id: &str, duration_nanos: i64);

    /// Returns `true` when no history is available.
    fn is_empty(&self) -> bool;
}

/// In-memory duration index backed by an ordered map.
///
/// The ordered map turns prefix lookups into a range scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestDurations {
    tests: BTreeMap<String, DurationSample>,
}

impl TestDurations {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tests with history.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// Returns the sample recorded for `test_id`, if any.
    pub fn get(&self, test_id: &str) -> Option<&DurationSample> {
        self.tests.get(test_id)
    }

    /// Iterates over all samples in test-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DurationSample)> {
        self.tests.iter().map(|(name, sample)| (name.as_str(), sample))
    }

    /// Merges another index into this one.
    ///
    /// Entries from `other` replace entries with the same name only when
    /// they carry more runs, so merging never loses history.
    pub fn merge(&mut self, other: TestDurations) {
        for (name, sample) in other.tests {
            match self.tests.get(&name) {
                Some(existing) if existing.run_count >= sample.run_count => {}
                _ => {
                    self.tests.insert(name, sample);
                }
            }
        }
    }

    /// Reads an index from CSV.
    ///
    /// Test names may themselves contain commas (parameterised tests), so
    /// each line is split from the right.
    pub fn read_csv<R: BufRead>(reader: R) -> DurationsResult<Self> {
        let mut durations = Self::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            let line_no = idx + 1;

            if line.is_empty() || (line_no == 1 && line == CSV_HEADER) {
                continue;
            }

            let mut fields = line.rsplitn(3, ',');
            let runs = fields.next();
            let mean = fields.next();
            let name = fields.next();

            let (Some(name), Some(mean), Some(runs)) = (name, mean, runs) else {
                return Err(DurationsError::Parse {
                    line: line_no,
                    message: format!("expected 3 fields, got '{}'", line),
                });
            };

            let mean_nanos = mean.trim().parse::<i64>().map_err(|e| DurationsError::Parse {
                line: line_no,
                message: format!("invalid mean duration '{}': {}", mean, e),
            })?;
            let run_count = runs.trim().parse::<i64>().map_err(|e| DurationsError::Parse {
                line: line_no,
                message: format!("invalid run count '{}': {}", runs, e),
            })?;

            durations.tests.insert(
                name.trim().to_string(),
                DurationSample {
                    mean_nanos,
                    run_count,
                },
            );
        }

        Ok(durations)
    }

    /// Writes the index as CSV, header first, in test-name order.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> DurationsResult<()> {
        writeln!(writer, "{}", CSV_HEADER)?;
        for (name, sample) in &self.tests {
            writeln!(writer, "{},{},{}", name, sample.mean_nanos, sample.run_count)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Loads an index from a CSV file.
    pub fn load(path: &Path) -> DurationsResult<Self> {
        let file = File::open(path)?;
        Self::read_csv(BufReader::new(file))
    }

    /// Loads an index, degrading to an empty one on any failure.
    ///
    /// History is an optimisation: without it the planner still produces a
    /// valid (seeded) distribution, so a missing store only warrants a
    /// warning.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(durations) => {
                info!(
                    "Loaded durations for {} tests from {}",
                    durations.len(),
                    path.display()
                );
                durations
            }
            Err(e) => {
                warn!(
                    "No usable test durations at {} ({}), falling back to seeded sharding",
                    path.display(),
                    e
                );
                Self::new()
            }
        }
    }

    /// Saves the index to a CSV file, creating parent directories.
    pub fn save(&self, path: &Path) -> DurationsResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        self.write_csv(BufWriter::new(file))?;
        debug!("Wrote {} test durations to {}", self.len(), path.display());
        Ok(())
    }

    /// Folds the results of a finished run into the index.
    ///
    /// Walks `root` for JUnit XML files. Tests with a positive duration are
    /// recorded as-is. Tests reporting zero are recorded at the current
    /// global mean, otherwise they would all pile into the lightest fork
    /// on the next run.
    ///
    /// Returns the number of test cases ingested.
    pub fn ingest_junit_dir(&mut self, root: &Path) -> usize {
        self.ingest_junit_dirs(std::iter::once(root))
    }

    /// Like [`TestDurations::ingest_junit_dir`] over several roots.
    ///
    /// A file that cannot be read or parsed is logged and skipped; the rest
    /// of the run still counts.
    pub fn ingest_junit_dirs<'a>(&mut self, roots: impl IntoIterator<Item = &'a Path>) -> usize {
        let mut ingested = 0;

        for root in roots {
            let mut from_root = 0;
            for entry in walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "xml"))
            {
                let cases = match read_junit_file(entry.path()) {
                    Ok(cases) => cases,
                    Err(e) => {
                        warn!("Skipping {}", e);
                        continue;
                    }
                };

                for (name, nanos) in cases.iter().filter(|(_, nanos)| *nanos > 0) {
                    self.record_sample(name, *nanos);
                }

                let mean = self.global_mean_duration_nanos();
                for (name, _) in cases.iter().filter(|(_, nanos)| *nanos <= 0) {
                    self.record_sample(name, mean);
                }

                from_root += cases.len();
            }
            debug!("Ingested {} test results from {}", from_root, root.display());
            ingested += from_root;
        }

        info!("Ingested {} test results", ingested);
        ingested
    }
}

fn read_junit_file(path: &Path) -> DurationsResult<Vec<(String, i64)>> {
    let xml_error = |message: String| DurationsError::Xml {
        path: path.display().to_string(),
        message,
    };
    let bytes = std::fs::read(path).map_err(|e| xml_error(e.to_string()))?;
    junit::durations_from_junit_xml(&String::from_utf8_lossy(&bytes))
        .map_err(|e| xml_error(e.to_string()))
}

impl DurationIndex for TestDurations {
    fn lookup(&self, prefix: &str) -> Vec<(String, i64)> {
        self.tests
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, sample)| (name.clone(), sample.mean_nanos))
            .collect()
    }

    fn global_mean_duration_nanos(&self) -> i64 {
        if self.tests.is_empty() {
            return FALLBACK_MEAN_NANOS;
        }
        let total: i128 = self
            .tests
            .values()
            .map(|s| i128::from(s.mean_nanos))
            .sum();
        (total / self.tests.len() as i128) as i64
    }

    fn record_sample(&mut self, test_id: &str, duration_nanos: i64) {
        match self.tests.get_mut(test_id) {
            Some(sample) => sample.record(duration_nanos),
            None => {
                self.tests
                    .insert(test_id.to_string(), DurationSample::new(duration_nanos));
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
