mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{cmd_build, cmd_index, cmd_info, cmd_publish};
use crate::output::{OutputFormat, print_error};

/// Reproducible native dependency bootstrap and mirror publication
#[derive(Parser)]
#[command(name = "nativeboot")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging (overridden by RUST_LOG)
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch, verify and build the dependencies in a plan
  Build {
    /// JSON plan file
    plan: PathBuf,

    /// Build only this member and what it depends on
    #[arg(long)]
    only: Option<String>,

    /// Parent directory for run workspaces
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Limit for each download or git command (e.g. 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    fetch_timeout: Option<Duration>,

    /// Default limit for each build step (e.g. 1h)
    #[arg(long, value_parser = humantime::parse_duration)]
    step_timeout: Option<Duration>,

    /// Only show toolchain output for failing steps
    #[arg(short, long)]
    quiet: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Stage built artifacts into a mirror tree
  #[command(group(ArgGroup::new("history").required(true).args(["mirror", "previous", "new_mirror"])))]
  Index {
    /// Directory searched for built artifacts
    #[arg(long, default_value = "dist")]
    dist: PathBuf,

    /// Directory the mirror tree is written to (replaced)
    #[arg(long)]
    dest: PathBuf,

    /// Mirror URL whose packages.json is extended (http(s)://..., file://... or a directory)
    #[arg(long)]
    mirror: Option<String>,

    /// Local copy of the mirror's packages.json
    #[arg(long)]
    previous: Option<PathBuf>,

    /// Start a mirror with no published history
    #[arg(long)]
    new_mirror: bool,

    /// Recorded as uploaded_by for new entries (default: git@<commit>)
    #[arg(long)]
    uploaded_by: Option<String>,

    /// Recorded as upload_timestamp for new entries (default: commit time)
    #[arg(long)]
    timestamp: Option<u64>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Upload a staged mirror tree to a store
  Publish {
    /// Root of the staged tree
    source_root: PathBuf,

    /// Store URL: http(s)://..., file://... or a directory path
    #[arg(long)]
    store: String,

    /// Show what would be uploaded without touching the store
    #[arg(long)]
    dry_run: bool,

    /// Concurrent uploads within one class
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Display platform and configuration
  Info {
    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "warn" }));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build {
      plan,
      only,
      work_dir,
      fetch_timeout,
      step_timeout,
      quiet,
      output,
    } => cmd_build(
      &plan,
      only.as_deref(),
      cmd::BuildFlags {
        work_dir,
        fetch_timeout,
        step_timeout,
        quiet,
      },
      output,
    ),
    Commands::Index {
      dist,
      dest,
      mirror,
      previous,
      new_mirror: _,
      uploaded_by,
      timestamp,
      output,
    } => {
      let history = match (mirror, previous) {
        (Some(url), _) => cmd::History::Mirror(url),
        (None, Some(path)) => cmd::History::File(path),
        (None, None) => cmd::History::Empty,
      };
      cmd_index(&dist, &dest, history, uploaded_by, timestamp, output)
    }
    Commands::Publish {
      source_root,
      store,
      dry_run,
      jobs,
      output,
    } => cmd_publish(&source_root, &store, dry_run, jobs, output),
    Commands::Info { output } => cmd_info(output),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}
