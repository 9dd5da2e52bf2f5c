use anyhow::{Context, Result};

use nativeboot_lib::config::{Config, Overrides};
use nativeboot_lib::platform::Platform;

use crate::output::{OutputFormat, print_json, print_stat};

pub fn cmd_info(output: OutputFormat) -> Result<()> {
  let config = Config::resolve(Overrides::default()).context("config")?;
  let platform = Platform::current().map(|p| p.triple());

  if output.is_json() {
    return print_json(&serde_json::json!({
      "version": env!("CARGO_PKG_VERSION"),
      "platform": platform,
      "work_dir": config.work_dir,
      "fetch_timeout": humantime::format_duration(config.fetch_timeout).to_string(),
      "step_timeout": humantime::format_duration(config.step_timeout).to_string(),
      "upload_jobs": config.upload_jobs,
      "store_token": config.store_token.is_some(),
    }));
  }

  println!("nativeboot {}", env!("CARGO_PKG_VERSION"));
  print_stat("Platform", platform.as_deref().unwrap_or("unknown"));
  print_stat(
    "Work dir",
    &config
      .work_dir
      .map(|d| d.display().to_string())
      .unwrap_or_else(|| "system temp".to_string()),
  );
  print_stat("Fetch timeout", &humantime::format_duration(config.fetch_timeout).to_string());
  print_stat("Step timeout", &humantime::format_duration(config.step_timeout).to_string());
  print_stat("Upload jobs", &config.upload_jobs.to_string());
  print_stat("Store token", if config.store_token.is_some() { "set" } else { "not set" });

  Ok(())
}
