//! Implementation of the `nativeboot publish` command.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};

use nativeboot_lib::config::{Config, Overrides};
use nativeboot_lib::publish::{OperationOutcome, PublishManifest, PublishOptions, Store, publish};

use crate::output::{OutputFormat, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_publish(source_root: &Path, store_url: &str, dry_run: bool, jobs: Option<usize>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let source_root = dunce::canonicalize(source_root).with_context(|| format!("publish: {}", source_root.display()))?;
  if !source_root.is_dir() {
    bail!("publish: {} is not a directory", source_root.display());
  }

  let config = Config::resolve(Overrides {
    upload_jobs: jobs,
    ..Default::default()
  })
  .context("config")?;

  let store = Store::connect(store_url, config.fetch_timeout, config.store_token.clone()).context("publish")?;
  let manifest = PublishManifest::from_tree(&source_root).context("publish")?;

  let options = PublishOptions {
    dry_run,
    jobs: config.upload_jobs,
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(publish(&manifest, &source_root, Arc::new(store), options))
    .context("publish")?;

  if output.is_json() {
    return print_json(&report);
  }

  if report.operations.is_empty() {
    print_info(&format!("nothing to publish in {}", source_root.display()));
    return Ok(());
  }

  if dry_run {
    print_info("Dry run - store not modified");
    for op in &report.operations {
      let note = if op.outcome == OperationOutcome::SkippedExisting {
        ", already present"
      } else {
        ""
      };
      println!("  {:<9} {} ({}{note})", op.class.to_string(), op.path, op.cache_control);
    }
    print_stat("Planned", &report.count(OperationOutcome::Planned).to_string());
  } else {
    print_success(&format!("published to {store_url}"));
    print_stat("Uploaded", &report.count(OperationOutcome::Uploaded).to_string());
  }
  print_stat("Already present", &report.count(OperationOutcome::SkippedExisting).to_string());
  print_stat("Duration", &format_duration(start.elapsed()));

  Ok(())
}
