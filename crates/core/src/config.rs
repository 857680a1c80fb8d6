use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "DRAWANIM_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub render_host: RenderHostConfig,
    pub paths: PathsConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    pub rpc: RpcConfig,
}

/// Gateway bind address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Render host bind address, plus the URL the gateway dials to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RenderHostConfig {
    pub port: u16,
    pub host: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Per-`ad_id` workspaces as seen by the gateway.
    pub files_dir: PathBuf,
    /// The same tree as seen by the render host (differs when the two run in
    /// separate containers with different mounts).
    pub render_workspace_dir: PathBuf,
    /// Motion and retarget configs shipped with the renderer.
    pub render_config_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub max_queue_length: usize,
}

/// Render executable; the job's config path is appended as the last argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
}

/// Status session timing. Periods and limits are counted in ticks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_ms: u64,
    pub connection_period: u64,
    pub finish_check_period: u64,
    pub finish_check_grace: u64,
    pub max_render_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub max_ping_retries: u32,
    pub max_pong_retries: u32,
    pub retry_interval_ms: u64,
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RpcConfig {
    pub call_timeout_ms: u64,
    pub finish_check_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for RenderHostConfig {
    fn default() -> Self {
        Self {
            port: 8001,
            host: "0.0.0.0".to_string(),
            url: "http://127.0.0.1:8001".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            files_dir: PathBuf::from("files"),
            render_workspace_dir: PathBuf::from("files"),
            render_config_dir: PathBuf::from("config"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            max_queue_length: 4,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-m".to_string(), "animated_drawings.render".to_string()],
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            connection_period: 5,
            finish_check_period: 2,
            finish_check_grace: 20,
            max_render_time: 180,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_ping_retries: 4,
            max_pong_retries: 4,
            retry_interval_ms: 300,
            response_timeout_ms: 3000,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 3000,
            finish_check_timeout_ms: 7000,
        }
    }
}

impl SessionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl HeartbeatConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl RpcConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn finish_check_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_check_timeout_ms)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_jobs == 0 {
            bail!("scheduler.max_concurrent_jobs must be at least 1");
        }
        if self.worker.program.trim().is_empty() {
            bail!("worker.program must not be empty");
        }
        if self.session.tick_ms == 0 {
            bail!("session.tick_ms must be greater than 0");
        }
        if self.session.connection_period == 0 || self.session.finish_check_period == 0 {
            bail!("session periods must be at least 1 tick");
        }
        if self.heartbeat.max_ping_retries == 0 || self.heartbeat.max_pong_retries == 0 {
            bail!("heartbeat retry limits must be at least 1");
        }
        if self.heartbeat.response_timeout_ms == 0 {
            bail!("heartbeat.response_timeout_ms must be greater than 0");
        }
        if self.rpc.call_timeout_ms == 0 || self.rpc.finish_check_timeout_ms == 0 {
            bail!("rpc timeouts must be greater than 0");
        }
        Ok(())
    }

    /// Returns a copy with every relative path resolved against `base`.
    pub fn resolved_paths(&self, base: &Path) -> PathsConfig {
        PathsConfig {
            files_dir: resolve_relative_to(base, &self.paths.files_dir),
            render_workspace_dir: resolve_relative_to(base, &self.paths.render_workspace_dir),
            render_config_dir: resolve_relative_to(base, &self.paths.render_config_dir),
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. DRAWANIM_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml only if none
/// exists yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.render_host.port, 8001);
        assert_eq!(cfg.render_host.url, "http://127.0.0.1:8001");
        assert_eq!(cfg.paths.files_dir, PathBuf::from("files"));

        assert_eq!(cfg.scheduler.max_concurrent_jobs, 1);
        assert_eq!(cfg.scheduler.max_queue_length, 4);

        assert_eq!(cfg.session.connection_period, 5);
        assert_eq!(cfg.session.finish_check_period, 2);
        assert_eq!(cfg.session.finish_check_grace, 20);
        assert_eq!(cfg.session.max_render_time, 180);
        assert_eq!(cfg.session.tick(), Duration::from_secs(1));

        assert_eq!(cfg.heartbeat.max_ping_retries, 4);
        assert_eq!(cfg.heartbeat.max_pong_retries, 4);
        assert_eq!(cfg.heartbeat.retry_interval(), Duration::from_millis(300));
        assert_eq!(cfg.heartbeat.response_timeout(), Duration::from_secs(3));

        assert_eq!(cfg.rpc.call_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.rpc.finish_check_timeout(), Duration::from_secs(7));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_remaining_sections_with_defaults() {
        let decoded: AppConfig =
            toml::from_str("[scheduler]\nmax_queue_length = 0\n").expect("deserialize config");

        assert_eq!(decoded.scheduler.max_queue_length, 0);
        assert_eq!(decoded.scheduler.max_concurrent_jobs, 1);
        assert_eq!(decoded.session, SessionConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_rejects_zero_concurrency() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduler]\nmax_concurrent_jobs = 0\n").expect("write config");

        let err = AppConfig::load_from_path(&path).expect_err("zero slots must be rejected");
        assert!(format!("{err:#}").contains("max_concurrent_jobs"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("data");
        initialize_data_dir(&dir).expect("initialize data dir");

        assert!(dir.exists());
        assert!(dir.join("config.toml").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolved_paths_keep_absolute_entries() {
        let mut cfg = AppConfig::default();
        cfg.paths.render_workspace_dir = PathBuf::from("/mnt/render/files");

        let resolved = cfg.resolved_paths(Path::new("/srv/data"));
        assert_eq!(resolved.files_dir, PathBuf::from("/srv/data/files"));
        assert_eq!(
            resolved.render_workspace_dir,
            PathBuf::from("/mnt/render/files")
        );
        assert_eq!(resolved.render_config_dir, PathBuf::from("/srv/data/config"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
    }
}
