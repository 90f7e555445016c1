//! Console and file output for a finished run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::RunReport;
use crate::scheduler::ForkPlan;

/// File name of the JSON summary inside the output directory.
pub const SUMMARY_FILE: &str = "podfork-summary.json";

/// Progress bar counting finished forks. Hidden when disabled.
pub struct ForkProgress {
    bar: Option<ProgressBar>,
}

impl ForkProgress {
    pub fn new(forks: usize, enabled: bool) -> Self {
        let bar = enabled.then(|| {
            let bar = ProgressBar::new(forks as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} forks {msg}")
            {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        });
        Self { bar }
    }

    pub fn fork_finished(&self, fork: usize, succeeded: bool) {
        if let Some(bar) = &self.bar {
            let mark = if succeeded {
                console::style("ok").green()
            } else {
                console::style("failed").red()
            };
            bar.set_message(format!("(fork {} {})", fork, mark));
            bar.inc(1);
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Prints per-fork outcomes and the overall verdict.
pub fn print_summary(report: &RunReport) {
    println!();
    println!("Forks (run {}):", report.stable_id);

    for result in &report.results {
        if result.pod_name.is_empty() {
            println!(
                "  {:>3}  {}",
                result.fork_index,
                console::style("no tests assigned").dim()
            );
            continue;
        }
        let code = if result.exit_code == 0 {
            console::style(format!("exit {}", result.exit_code)).green()
        } else {
            console::style(format!("exit {}", result.exit_code)).red().bold()
        };
        println!(
            "  {:>3}  {}  {}  ({} attempt(s), {}s)",
            result.fork_index, code, result.pod_name, result.attempts, result.duration_secs
        );
        for dir in &result.result_artifact_dirs {
            println!("         {}", console::style(dir.display()).dim());
        }
    }

    for failure in &report.failures {
        println!(
            "  {:>3}  {}  {}",
            failure.fork_index,
            console::style("no result").red().bold(),
            failure.error
        );
    }

    println!("  Duration: {}s", report.duration_secs);

    println!();
    match report.first_error() {
        None => println!("{}", console::style("All forks succeeded.").green().bold()),
        Some(e) => println!("{}", console::style(e).red().bold()),
    }
}

/// Writes the report as JSON to [`SUMMARY_FILE`] under `output_dir`.
pub fn write_summary_json(report: &RunReport, output_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let path = output_dir.join(SUMMARY_FILE);
    let json = serde_json::to_string_pretty(report).context("Failed to serialize summary")?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Prints what each fork would run.
pub fn print_plan(plan: &ForkPlan) {
    for fork in plan.forks() {
        let expected = if fork.expected_duration_nanos > 0 {
            format!(
                " ~{:.1}s",
                fork.expected_duration_nanos as f64 / 1_000_000_000.0
            )
        } else {
            String::new()
        };
        println!(
            "{}{}",
            console::style(format!("fork {}", fork.fork_index)).bold(),
            console::style(expected).dim()
        );
        if fork.is_empty() {
            println!("  {}", console::style("(nothing to run)").dim());
        }
        for (task, filters) in &fork.filters {
            println!("  {}", task);
            for filter in filters {
                println!("    {}", filter);
            }
        }
    }
}
