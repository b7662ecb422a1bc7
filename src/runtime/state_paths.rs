use super::RuntimeError;
use crate::config::GLOBAL_STATE_DIR;
use std::fs;
use std::path::{Path, PathBuf};

/// Layout of everything the orchestrator persists under the state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn required_directories(&self) -> Vec<PathBuf> {
        vec![
            self.groups_dir(),
            self.global_dir(),
            self.sessions_dir(),
            self.ipc_root(),
            self.ipc_errors_dir(),
            self.registry_dir(),
            self.inbox_incoming_dir(),
            self.inbox_processing_dir(),
            self.inbox_errors_dir(),
            self.outbox_dir(),
            self.logs_dir(),
            self.daemon_dir(),
        ]
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir().join(folder)
    }

    /// Shared read-only namespace visible to non-main groups.
    pub fn global_dir(&self) -> PathBuf {
        self.groups_dir().join("global")
    }

    pub fn group_logs_dir(&self, folder: &str) -> PathBuf {
        self.group_dir(folder).join("logs")
    }

    pub fn run_log_path(&self, folder: &str, run_id: &str) -> PathBuf {
        self.group_logs_dir(folder).join(format!("{run_id}.log"))
    }

    pub fn sandbox_audit_path(&self, folder: &str) -> PathBuf {
        self.group_logs_dir(folder).join("sandbox-violations.jsonl")
    }

    pub fn task_log_path(&self, folder: &str) -> PathBuf {
        self.group_logs_dir(folder).join("tasks.jsonl")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_dir(&self, folder: &str) -> PathBuf {
        self.sessions_dir().join(folder)
    }

    pub fn ipc_root(&self) -> PathBuf {
        self.root.join("ipc")
    }

    pub fn ipc_namespace(&self, folder: &str) -> PathBuf {
        self.ipc_root().join(folder)
    }

    pub fn ipc_messages_dir(&self, folder: &str) -> PathBuf {
        self.ipc_namespace(folder).join("messages")
    }

    pub fn ipc_tasks_dir(&self, folder: &str) -> PathBuf {
        self.ipc_namespace(folder).join("tasks")
    }

    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_root().join("errors")
    }

    pub fn health_snapshot_path(&self, main_folder: &str) -> PathBuf {
        self.ipc_namespace(main_folder).join("health.json")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn inbox_incoming_dir(&self) -> PathBuf {
        self.root.join("inbox/incoming")
    }

    pub fn inbox_processing_dir(&self) -> PathBuf {
        self.root.join("inbox/processing")
    }

    pub fn inbox_errors_dir(&self) -> PathBuf {
        self.root.join("inbox/errors")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("outbox")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn runtime_log_path(&self) -> PathBuf {
        self.logs_dir().join("runtime.log")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn supervisor_state_path(&self) -> PathBuf {
        self.daemon_dir().join("runtime.json")
    }

    pub fn stop_signal_path(&self) -> PathBuf {
        self.daemon_dir().join("stop")
    }

    /// Namespace directories a group's worker needs before it starts.
    pub fn ensure_group_namespace(&self, folder: &str) -> Result<(), RuntimeError> {
        for path in [
            self.group_dir(folder),
            self.group_logs_dir(folder),
            self.session_dir(folder),
            self.ipc_messages_dir(folder),
            self.ipc_tasks_dir(folder),
        ] {
            create_dir(&path)?;
        }
        Ok(())
    }
}

pub fn default_state_root_path() -> Result<PathBuf, RuntimeError> {
    let home = std::env::var_os("HOME").ok_or(RuntimeError::HomeDirectoryUnavailable)?;
    Ok(PathBuf::from(home).join(GLOBAL_STATE_DIR))
}

pub fn bootstrap_state_root(paths: &StatePaths) -> Result<(), RuntimeError> {
    for path in paths.required_directories() {
        create_dir(&path)?;
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), RuntimeError> {
    fs::create_dir_all(path).map_err(|source| RuntimeError::CreateDir {
        path: path.display().to_string(),
        source,
    })
}
