use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use crossdash::cache::CacheStore;
use crossdash::config::Config;
use crossdash::crossfilter::{Scalar, ToggleOptions};
use crossdash::scheduler::LoadOptions;
use crossdash::session::Session;

#[derive(Parser, Debug)]
#[command(name = "crossdash")]
#[command(about = "Load dashboard resources through the crossdash cache and scheduler")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crossdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overriding api.base_url
  #[arg(long)]
  base_url: Option<String>,

  /// Write logs to a daily-rotated file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load one resource
  Get {
    resource: String,
    #[command(flatten)]
    load: LoadArgs,
  },
  /// Load several resources concurrently
  Many {
    #[arg(required = true)]
    resources: Vec<String>,
    #[command(flatten)]
    load: LoadArgs,
  },
  /// Fetch a filtered aggregate
  Filtered {
    path: String,
    /// Filter as dimension=value; repeat for more
    #[arg(short, long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, Scalar)>,
    /// Accumulate repeated values of one dimension into a list
    #[arg(long)]
    multi: bool,
    #[command(flatten)]
    load: LoadArgs,
  },
  /// Inspect or maintain the cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Invalidate the given keys, or everything if none are given
  Clear { keys: Vec<String> },
  /// Remove expired entries from the durable tier
  Sweep,
}

#[derive(clap::Args, Debug)]
struct LoadArgs {
  /// Skip the cache for both reads and writes
  #[arg(long)]
  no_cache: bool,
  /// Retries for transient faults
  #[arg(long)]
  retries: Option<u32>,
  /// Per-attempt timeout in milliseconds
  #[arg(long)]
  timeout_ms: Option<u64>,
  /// JSON value returned when the load degrades
  #[arg(long)]
  fallback: Option<String>,
  /// Jump ahead of normal-priority requests
  #[arg(long)]
  high: bool,
}

impl LoadArgs {
  fn options(&self) -> Result<LoadOptions> {
    let mut options = LoadOptions::default();
    if let Some(raw) = &self.fallback {
      let fallback: Value =
        serde_json::from_str(raw).map_err(|e| eyre!("Invalid --fallback JSON: {}", e))?;
      options = options.fallback(fallback);
    }
    if let Some(retries) = self.retries {
      options = options.retries(retries);
    }
    if let Some(ms) = self.timeout_ms {
      options = options.timeout(Duration::from_millis(ms));
    }
    if self.no_cache {
      options = options.no_cache();
    }
    if self.high {
      options = options.high_priority();
    }
    Ok(options)
  }
}

fn parse_filter(raw: &str) -> std::result::Result<(String, Scalar), String> {
  let (dimension, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected dimension=value, got {}", raw))?;
  if dimension.is_empty() {
    return Err(format!("missing dimension in {}", raw));
  }
  Ok((dimension.to_string(), Scalar::parse(value)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = crossdash::logging::init(args.log_dir.as_deref())?;

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(base_url) = args.base_url {
    config.api.base_url = Some(base_url);
  }

  match args.command {
    Command::Cache { action } => {
      let cache = CacheStore::from_config(&config.cache)?;
      match action {
        CacheAction::Clear { keys } => {
          if keys.is_empty() {
            cache.invalidate(None);
          } else {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            cache.invalidate(Some(&keys));
          }
        }
        CacheAction::Sweep => {
          let removed = cache.sweep_durable();
          print_json(&json!({ "removed": removed }))?;
        }
      }
    }
    Command::Get { resource, load } => {
      let session = Session::from_config(config)?;
      let value = session.scheduler().load(&resource, load.options()?).await?;
      print_json(&*value)?;
      tracing::debug!(stats = ?session.scheduler().stats(), "done");
    }
    Command::Many { resources, load } => {
      let session = Session::from_config(config)?;
      let outcomes = session.scheduler().load_many(resources, load.options()?).await;
      let report: Vec<Value> = outcomes
        .iter()
        .map(|o| {
          json!({
            "resource": o.resource,
            "value": o.value(),
            "error": o.error().map(|e| e.to_string()),
          })
        })
        .collect();
      print_json(&report)?;
    }
    Command::Filtered {
      path,
      filters,
      multi,
      load,
    } => {
      let session = Session::from_config(config)?;
      session.navigate("cli");
      let toggle = ToggleOptions {
        multi_select: multi,
        clear_previous: false,
      };
      for (dimension, value) in filters {
        session.filters().register_dimension(dimension.as_str());
        session.filters().toggle(&dimension, value, toggle);
      }
      let aggregate = session.load_filtered(&path, load.options()?).await?;
      print_json(&aggregate)?;
    }
  }

  Ok(())
}
