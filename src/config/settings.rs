use super::{ConfigError, ExecutionMode};
use crate::shared::ids::{validate_identifier_value, GroupFolder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub state_root: PathBuf,
    pub project_root: PathBuf,
    #[serde(default)]
    pub default_mode: ExecutionMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Seeds the registry with the trusted group when none is registered.
    #[serde(default)]
    pub main_group: Option<MainGroupSettings>,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub ipc: IpcSettings,
    #[serde(default)]
    pub isolated: IsolatedSettings,
    #[serde(default)]
    pub host_native: HostNativeSettings,
    #[serde(default)]
    pub integration_servers: BTreeMap<String, IntegrationServer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MainGroupSettings {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_main_folder")]
    pub folder: String,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            worker_timeout_secs: default_worker_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IpcSettings {
    #[serde(default = "default_ipc_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_ipc_poll_interval_ms(),
        }
    }
}

impl IpcSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IsolatedSettings {
    #[serde(default = "default_runtime_bin")]
    pub runtime_bin: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub extra_run_args: Vec<String>,
}

impl Default for IsolatedSettings {
    fn default() -> Self {
        Self {
            runtime_bin: default_runtime_bin(),
            image: default_image(),
            max_output_bytes: default_max_output_bytes(),
            extra_run_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxWrapper {
    /// `sandbox-exec` on macOS, `bwrap` elsewhere.
    #[default]
    Auto,
    SandboxExec,
    Bubblewrap,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostNativeSettings {
    #[serde(default = "default_worker_command")]
    pub worker_command: Vec<String>,
    #[serde(default)]
    pub sandbox_wrapper: SandboxWrapper,
    #[serde(default)]
    pub sandbox_wrapper_bin: Option<String>,
    /// Source of the host-native security profile. Absent means host-native
    /// execution is ungoverned and startup must refuse it.
    #[serde(default)]
    pub security: Option<HostNativeSecurity>,
    /// Extra variable names forwarded to host-native workers.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
}

impl Default for HostNativeSettings {
    fn default() -> Self {
        Self {
            worker_command: default_worker_command(),
            sandbox_wrapper: SandboxWrapper::default(),
            sandbox_wrapper_bin: None,
            security: None,
            env_passthrough: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostNativeSecurity {
    /// Sandbox non-main groups. Only an explicit `false` disables it.
    #[serde(default = "default_true")]
    pub sandbox_non_main: bool,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub deny_paths: Vec<PathBuf>,
    #[serde(default)]
    pub deny_network_outbound: bool,
}

impl Default for HostNativeSecurity {
    fn default() -> Self {
        Self {
            sandbox_non_main: true,
            allowed_tools: None,
            deny_paths: Vec::new(),
            deny_network_outbound: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationScope {
    Project,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrationServer {
    pub scope: IntegrationScope,
    /// Empty means every mode.
    #[serde(default)]
    pub modes: Vec<ExecutionMode>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl IntegrationServer {
    pub fn enabled_for(&self, mode: ExecutionMode) -> bool {
        self.modes.is_empty() || self.modes.contains(&mode)
    }
}

fn default_true() -> bool {
    true
}

fn default_main_folder() -> String {
    "main".to_string()
}

fn default_max_concurrency() -> usize {
    5
}

fn default_worker_timeout_secs() -> u64 {
    1800
}

fn default_stop_grace_secs() -> u64 {
    15
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    5_000
}

fn default_retry_max_delay_ms() -> u64 {
    300_000
}

fn default_ipc_poll_interval_ms() -> u64 {
    1_000
}

fn default_runtime_bin() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "groupclaw-agent:latest".to_string()
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_worker_command() -> Vec<String> {
    vec!["groupclaw-agent".to_string()]
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.state_root.is_absolute() {
            return Err(ConfigError::Settings(
                "`state_root` must be an absolute path".to_string(),
            ));
        }
        if !self.project_root.is_absolute() {
            return Err(ConfigError::Settings(
                "`project_root` must be an absolute path".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Settings(
                "`max_concurrency` must be >= 1".to_string(),
            ));
        }
        if let Some(main) = &self.main_group {
            validate_identifier_value("`main_group.id`", &main.id).map_err(ConfigError::Settings)?;
            GroupFolder::parse(&main.folder)
                .map_err(|err| ConfigError::Settings(format!("`main_group.folder`: {err}")))?;
        }
        if self.timeouts.worker_timeout_secs == 0 {
            return Err(ConfigError::Settings(
                "`timeouts.worker_timeout_secs` must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "`retry.max_attempts` must be >= 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Settings(
                "`retry.base_delay_ms` must not exceed `retry.max_delay_ms`".to_string(),
            ));
        }
        if self.ipc.poll_interval_ms == 0 {
            return Err(ConfigError::Settings(
                "`ipc.poll_interval_ms` must be > 0".to_string(),
            ));
        }
        if self.isolated.runtime_bin.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`isolated.runtime_bin` must be non-empty".to_string(),
            ));
        }
        if self.isolated.image.trim().is_empty() {
            return Err(ConfigError::Settings(
                "`isolated.image` must be non-empty".to_string(),
            ));
        }
        if self.isolated.max_output_bytes == 0 {
            return Err(ConfigError::Settings(
                "`isolated.max_output_bytes` must be > 0".to_string(),
            ));
        }
        if self
            .host_native
            .worker_command
            .first()
            .map(|bin| bin.trim().is_empty())
            .unwrap_or(true)
        {
            return Err(ConfigError::Settings(
                "`host_native.worker_command` must name a program".to_string(),
            ));
        }
        if let Some(security) = &self.host_native.security {
            for path in &security.deny_paths {
                if !path.is_absolute() {
                    return Err(ConfigError::Settings(format!(
                        "`host_native.security.deny_paths` entry `{}` must be absolute",
                        path.display()
                    )));
                }
            }
        }
        for (name, server) in &self.integration_servers {
            if name.trim().is_empty() {
                return Err(ConfigError::Settings(
                    "`integration_servers` keys must be non-empty".to_string(),
                ));
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "integration server `{name}` requires a non-empty `command`"
                )));
            }
        }
        Ok(())
    }
}
