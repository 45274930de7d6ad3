use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extent::AreaOfInterest;
use crate::models::RequiredField;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub records: RecordsConfig,
    pub orphans: OrphansConfig,
    #[serde(default)]
    pub parent: ParentConfig,
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub area_of_interest: AreaConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordsConfig {
    pub root_path: PathBuf,
    #[serde(default = "default_child_globs")]
    pub child_globs: Vec<String>,
}

fn default_child_globs() -> Vec<String> {
    vec!["**/metadata/*.xml".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrphansConfig {
    pub registry_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TitleStyle {
    #[default]
    StorageName,
    Descriptive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParentConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_id_namespace")]
    pub id_namespace: String,
    #[serde(default)]
    pub title: TitleStyle,
    /// Write `Updated` into the update type when a reconcile changes the envelope.
    #[serde(default)]
    pub mark_updates: bool,
}

impl Default for ParentConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            id_namespace: default_id_namespace(),
            title: TitleStyle::default(),
            mark_updates: false,
        }
    }
}

fn default_base_url() -> String {
    "https://data.met.no/dataset".to_string()
}
fn default_id_namespace() -> String {
    "no.met".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockingConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl LockingConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_max_attempts() -> u32 {
    50
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_stale_after_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AreaConfig {
    /// Polygon as `[longitude, latitude]` pairs. Built-in polygon when absent.
    #[serde(default)]
    pub vertices: Option<AreaOfInterest>,
}

impl AreaConfig {
    pub fn polygon(&self) -> AreaOfInterest {
        self.vertices.clone().unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ValidationConfig {
    /// Replaces the built-in platform table when non-empty.
    #[serde(default)]
    pub families: Vec<FamilyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FamilyConfig {
    /// Filename prefix, e.g. `S1`. An empty prefix matches every platform.
    pub prefix: String,
    pub required: Vec<RequiredField>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Config rooted at `root` with every optional section at its default.
    pub fn with_root(root: &Path) -> Self {
        Config {
            records: RecordsConfig {
                root_path: root.join("records"),
                child_globs: default_child_globs(),
            },
            orphans: OrphansConfig {
                registry_path: root.join("orphans.txt"),
            },
            parent: ParentConfig::default(),
            locking: LockingConfig::default(),
            area_of_interest: AreaConfig::default(),
            validation: ValidationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.records.root_path.as_os_str().is_empty() {
        anyhow::bail!("records.root_path must not be empty");
    }
    if config.orphans.registry_path.as_os_str().is_empty() {
        anyhow::bail!("orphans.registry_path must not be empty");
    }
    if config.records.child_globs.is_empty() {
        anyhow::bail!("records.child_globs must list at least one pattern");
    }

    let trimmed = config.parent.base_url.trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        anyhow::bail!("parent.base_url must not be empty");
    }
    config.parent.base_url = trimmed;
    if config.parent.id_namespace.is_empty() {
        anyhow::bail!("parent.id_namespace must not be empty");
    }

    if config.locking.max_attempts == 0 {
        anyhow::bail!("locking.max_attempts must be >= 1");
    }

    for family in &config.validation.families {
        if family.required.contains(&RequiredField::RelatedDataset) {
            anyhow::bail!(
                "validation.families '{}': related_dataset is always required and must not be listed",
                family.prefix
            );
        }
    }

    Ok(config)
}
