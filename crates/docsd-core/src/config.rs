//! `docsd.toml` configuration surface, loaded with field-level defaults and
//! merged with environment-variable overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use docsd_types::duration::{
    deserialize_duration, deserialize_duration_opt, serialize_duration, serialize_duration_opt,
};
use docsd_types::RepositoryDescriptor;

use crate::error::ConfigError;

/// How the pipeline resolves the on-disk workspace for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloneStrategy {
    /// Always clone into a fresh `<output_dir>/_workspace`.
    #[default]
    Fresh,
    /// Reuse `<repo_cache_dir>/working` (or `<output_dir>-workspace` if no
    /// cache dir is configured) across builds.
    Cached,
}

/// Build-behavior knobs (§6, `Build.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub skip_if_unchanged: bool,
    pub detect_deletions: bool,
    pub clone_strategy: CloneStrategy,
    pub workspace_dir: Option<PathBuf>,
    pub live_reload: bool,
    pub namespace_forges: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            skip_if_unchanged: true,
            detect_deletions: true,
            clone_strategy: CloneStrategy::default(),
            workspace_dir: None,
            live_reload: false,
            namespace_forges: false,
        }
    }
}

/// Site output knobs (§6, `Output.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub clean: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./site"),
            clean: false,
        }
    }
}

fn default_queue_size() -> usize {
    100
}

fn default_concurrent_builds() -> usize {
    2
}

fn default_schedule() -> String {
    "0 */15 * * * *".to_string()
}

/// Build-request coalescing timers (§4.2, `Daemon.Sync.Debounce.*`). Each
/// field accepts either a humantime string (`"200ms"`) or a raw millisecond
/// integer in `docsd.toml`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub quiet_window: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub poll_interval: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_window: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Scheduling and concurrency knobs (§6, `Daemon.Sync.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSyncConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_concurrent_builds")]
    pub concurrent_builds: usize,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub debounce: DebounceConfig,
}

impl Default for DaemonSyncConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            concurrent_builds: default_concurrent_builds(),
            schedule: default_schedule(),
            debounce: DebounceConfig::default(),
        }
    }
}

/// Storage knobs (§6, `Daemon.Storage.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub repo_cache_dir: Option<PathBuf>,
    /// Interval between debounced state-store flushes. `None` keeps the
    /// daemon's built-in default.
    #[serde(
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt"
    )]
    pub flush_interval: Option<Duration>,
}

/// `Daemon.*` nests sync and storage under one table, matching the dotted
/// path names used throughout §6 (`Daemon.Sync.QueueSize`, `Daemon.Storage.RepoCacheDir`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub sync: DaemonSyncConfig,
    pub storage: StorageConfig,
}

/// A configured forge integration (out of scope: the REST protocol itself;
/// the core only needs enough to resolve which secret backs a webhook and
/// which repositories a discovery pass should be trusted for).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Name of the environment variable holding the webhook HMAC secret.
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
}

/// Repository-list filtering applied to discovery results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl FilteringConfig {
    /// Does `repo_full_name` (or clone URL) survive this filter?
    pub fn allows(&self, candidate: &str) -> bool {
        if !self.exclude.is_empty() && self.exclude.iter().any(|p| candidate.contains(p.as_str()))
        {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| candidate.contains(p.as_str()))
    }
}

/// Top-level `docsd.toml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocsdConfig {
    pub build: BuildConfig,
    pub output: OutputConfig,
    pub daemon: DaemonConfig,
    pub repositories: Vec<RepositoryDescriptor>,
    pub forges: Vec<ForgeConfig>,
    pub filtering: FilteringConfig,
}

/// The subset of config hashed for `last_config_hash` persistence: fields
/// that change what a build produces. Secrets (forge tokens, webhook
/// secrets) and transient daemon knobs (queue size, concurrency, schedule)
/// are deliberately excluded so tuning the daemon's own throughput never
/// forces an unnecessary full rebuild.
#[derive(Serialize)]
struct ConfigHashPayload<'a> {
    repositories: &'a [RepositoryDescriptor],
    namespace_forges: bool,
    output_directory: &'a Path,
    filtering_include: &'a [String],
    filtering_exclude: &'a [String],
}

impl DocsdConfig {
    /// Load `docsd.toml` from `path`, then apply `DOCSD_*` environment
    /// overrides on top of the parsed document.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: DocsdConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides(&std::env::vars().collect())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DOCSD_*` overrides from an explicit env map (pulled out as a
    /// pure function of `load` so tests don't need `std::env` mutation).
    pub fn apply_env_overrides(
        &mut self,
        env: &BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = env.get("DOCSD_BUILD_SKIP_IF_UNCHANGED") {
            self.build.skip_if_unchanged = parse_bool("DOCSD_BUILD_SKIP_IF_UNCHANGED", v)?;
        }
        if let Some(v) = env.get("DOCSD_BUILD_DETECT_DELETIONS") {
            self.build.detect_deletions = parse_bool("DOCSD_BUILD_DETECT_DELETIONS", v)?;
        }
        if let Some(v) = env.get("DOCSD_BUILD_LIVE_RELOAD") {
            self.build.live_reload = parse_bool("DOCSD_BUILD_LIVE_RELOAD", v)?;
        }
        if let Some(v) = env.get("DOCSD_OUTPUT_DIRECTORY") {
            self.output.directory = PathBuf::from(v);
        }
        if let Some(v) = env.get("DOCSD_OUTPUT_CLEAN") {
            self.output.clean = parse_bool("DOCSD_OUTPUT_CLEAN", v)?;
        }
        if let Some(v) = env.get("DOCSD_DAEMON_SYNC_QUEUE_SIZE") {
            self.daemon.sync.queue_size =
                v.parse()
                    .map_err(|_| ConfigError::InvalidEnvOverride {
                        var: "DOCSD_DAEMON_SYNC_QUEUE_SIZE".to_string(),
                        value: v.clone(),
                        reason: "must be a positive integer".to_string(),
                    })?;
        }
        if let Some(v) = env.get("DOCSD_DAEMON_SYNC_CONCURRENT_BUILDS") {
            self.daemon.sync.concurrent_builds =
                v.parse()
                    .map_err(|_| ConfigError::InvalidEnvOverride {
                        var: "DOCSD_DAEMON_SYNC_CONCURRENT_BUILDS".to_string(),
                        value: v.clone(),
                        reason: "must be a positive integer".to_string(),
                    })?;
        }
        if let Some(v) = env.get("DOCSD_DAEMON_STORAGE_REPO_CACHE_DIR") {
            self.daemon.storage.repo_cache_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.sync.queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize(self.daemon.sync.queue_size));
        }
        if self.daemon.sync.concurrent_builds == 0 {
            return Err(ConfigError::InvalidConcurrentBuilds(
                self.daemon.sync.concurrent_builds,
            ));
        }
        if self.repositories.is_empty() && self.forges.is_empty() {
            return Err(ConfigError::NoRepositories);
        }
        Ok(())
    }

    /// Hash of the subset of config that affects build output, used by the
    /// skip evaluator and persisted as `last_config_hash`.
    pub fn compute_config_hash_for_persistence(&self) -> String {
        let payload = ConfigHashPayload {
            repositories: &self.repositories,
            namespace_forges: self.build.namespace_forges,
            output_directory: &self.output.directory,
            filtering_include: &self.filtering.include,
            filtering_exclude: &self.filtering.exclude,
        };
        let canonical =
            serde_json::to_vec(&payload).expect("config hash payload is always serializable");
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            var: var.to_string(),
            value: value.to_string(),
            reason: "must be a boolean (true/false/1/0/yes/no/on/off)".to_string(),
        }),
    }
}
