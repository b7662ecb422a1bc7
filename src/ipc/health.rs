use super::{io_err, IpcError};
use crate::config::{ExecutionMode, Settings};
use crate::registry::{GroupRecord, TrustLevel};
use crate::runner::resolve_mode;
use crate::runtime::StatePaths;
use crate::security::{resolve_security_profile, PermissionMode};
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub mode: ExecutionMode,
    pub available: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupHealth {
    pub id: String,
    pub folder: String,
    pub trust: TrustLevel,
    pub mode: ExecutionMode,
    pub mode_overridden: bool,
    pub sandbox_enabled: bool,
    pub permission_mode: PermissionMode,
}

/// Point-in-time view written for the main group. Workers read the file;
/// they never query the coordinator directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub generated_at: String,
    pub default_mode: ExecutionMode,
    pub host_native_security_configured: bool,
    pub integration_server_count: usize,
    pub backends: Vec<BackendHealth>,
    pub groups: Vec<GroupHealth>,
}

pub fn build_health_snapshot(
    settings: &Settings,
    groups: &[GroupRecord],
    backends: Vec<BackendHealth>,
) -> HealthSnapshot {
    let groups = groups
        .iter()
        .map(|group| {
            let mode = resolve_mode(group, settings);
            let profile = resolve_security_profile(group, mode, settings);
            GroupHealth {
                id: group.id.clone(),
                folder: group.folder.to_string(),
                trust: group.trust,
                mode,
                mode_overridden: group.execution_mode.is_some(),
                sandbox_enabled: profile.sandbox_enabled(),
                permission_mode: profile.permission_mode(),
            }
        })
        .collect();
    HealthSnapshot {
        generated_at: now_rfc3339(),
        default_mode: settings.default_mode,
        host_native_security_configured: settings.host_native.security.is_some(),
        integration_server_count: settings.integration_servers.len(),
        backends,
        groups,
    }
}

pub fn write_health_snapshot(
    paths: &StatePaths,
    main_folder: &str,
    snapshot: &HealthSnapshot,
) -> Result<PathBuf, IpcError> {
    let path = paths.health_snapshot_path(main_folder);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    atomic_write_json(&path, snapshot).map_err(|e| io_err(&path, e))?;
    Ok(path)
}
