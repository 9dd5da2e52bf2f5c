//! Implementation of the `nativeboot build` command.
//!
//! Loads a plan, runs it member by member and reports what was built or
//! skipped. Ctrl-C drops the running pipeline, which kills any child
//! process and removes the run's workspace.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use nativeboot_lib::build::ProcessToolchain;
use nativeboot_lib::config::{Config, Overrides};
use nativeboot_lib::env::Environment;
use nativeboot_lib::fetch::Fetcher;
use nativeboot_lib::pipeline::{Pipeline, PipelineError, PipelineOutcome, Plan};

use crate::output::{OutputFormat, format_duration, print_json, print_skip, print_stat, print_success};

pub struct BuildFlags {
  pub work_dir: Option<PathBuf>,
  pub fetch_timeout: Option<Duration>,
  pub step_timeout: Option<Duration>,
  pub quiet: bool,
}

pub fn cmd_build(plan_path: &Path, only: Option<&str>, flags: BuildFlags, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let config = Config::resolve(Overrides {
    work_dir: flags.work_dir,
    fetch_timeout: flags.fetch_timeout,
    step_timeout: flags.step_timeout,
    upload_jobs: None,
  })
  .context("config")?;

  let plan = Plan::load(plan_path).map_err(|e| staged(PipelineError::Plan(e)))?;

  let fetcher = Fetcher::new(Some(config.fetch_timeout)).map_err(|e| staged(e.into()))?;
  let mut pipeline = Pipeline::new(
    fetcher,
    ProcessToolchain { quiet: flags.quiet },
    Environment::from_process(),
  );
  pipeline.work_root = config.work_dir.clone();
  pipeline.step_timeout = Some(config.step_timeout);

  info!(plan = %plan_path.display(), members = plan.specs().len(), "loaded plan");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    tokio::select! {
      result = plan.run(&pipeline, only) => result.map_err(staged),
      _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    }
  })?;

  if output.is_json() {
    print_json(&report)?;
    return Ok(());
  }

  for entry in &report.entries {
    match &entry.outcome {
      PipelineOutcome::Built(artifacts) => print_success(&format!(
        "built {} ({} files in {})",
        entry.id,
        artifacts.files.len(),
        artifacts.prefix.display()
      )),
      PipelineOutcome::Skipped { reason } => print_skip(&format!("skipped: {reason}")),
    }
  }
  println!();
  print_stat("Built", &report.built().to_string());
  print_stat("Skipped", &report.skipped().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));

  Ok(())
}

/// Prefix the error with the stage it came from.
fn staged(err: PipelineError) -> anyhow::Error {
  let stage = err.stage();
  anyhow::Error::new(err).context(stage)
}
