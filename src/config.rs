use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub scheduler: SchedulerConfig,
  #[serde(default)]
  pub crossfilter: CrossfilterConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
  /// Base URL that resource paths are resolved against
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL applied when no pattern matches
  pub default_ttl_ms: u64,
  /// Entries whose TTL reaches this are mirrored to the durable tier
  pub durable_threshold_ms: u64,
  /// Key pattern -> TTL. `*` matches any run of characters.
  pub ttl_patterns: BTreeMap<String, u64>,
  pub durable: DurableConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 5_000,
      durable_threshold_ms: 10 * 60 * 1_000,
      ttl_patterns: BTreeMap::new(),
      durable: DurableConfig::default(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn durable_threshold(&self) -> Duration {
    Duration::from_millis(self.durable_threshold_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
  pub enabled: bool,
  /// Database path (default: $XDG_DATA_HOME/crossdash/durable.db)
  pub path: Option<PathBuf>,
  /// Page budget for the durable database; writes past it hit the quota path
  pub max_pages: Option<u32>,
  /// How often expired durable rows are swept
  pub sweep_interval_secs: u64,
}

impl Default for DurableConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      max_pages: Some(2_560),
      sweep_interval_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
  pub max_concurrent: usize,
  pub retry_base_delay_ms: u64,
  pub default_retry_count: u32,
  pub default_timeout_ms: u64,
  /// Ordered (substring, timeout) pairs; first match wins
  pub timeout_classes: Vec<TimeoutClass>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutClass {
  pub contains: String,
  pub timeout_ms: u64,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_concurrent: 6,
      retry_base_delay_ms: 1_000,
      default_retry_count: 1,
      default_timeout_ms: 10_000,
      timeout_classes: vec![
        TimeoutClass {
          contains: "filtered".to_string(),
          timeout_ms: 30_000,
        },
        TimeoutClass {
          contains: "aggregate".to_string(),
          timeout_ms: 30_000,
        },
        TimeoutClass {
          contains: "summary".to_string(),
          timeout_ms: 15_000,
        },
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrossfilterConfig {
  pub debounce_ms: u64,
  /// Dimensions seeded as `null` when a page session starts
  pub dimensions: Vec<String>,
  /// Dimension name -> backend field name used in filter clauses
  pub field_names: BTreeMap<String, String>,
}

impl Default for CrossfilterConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 100,
      dimensions: Vec::new(),
      field_names: BTreeMap::new(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./crossdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/crossdash/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("crossdash.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("crossdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API bearer token from the environment, if set.
  ///
  /// Checks CROSSDASH_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CROSSDASH_API_TOKEN").ok()
  }
}
