pub mod ipc_handler;
pub mod logging;
pub mod state_paths;
pub mod supervisor;

pub use ipc_handler::RuntimeIpcHandler;
pub use logging::append_runtime_log;
pub use state_paths::{bootstrap_state_root, default_state_root_path, StatePaths};
pub use supervisor::{
    bootstrap, bootstrap_with_backends, load_supervisor_state, save_supervisor_state, Runtime,
    SupervisorState,
};

use crate::config::ConfigError;
use crate::ipc::IpcError;
use crate::queue::QueueError;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to create runtime path {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to resolve home directory for runtime state root")]
    HomeDirectoryUnavailable,
    #[error("failed to read runtime state {path}: {source}")]
    ReadState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse runtime state {path}: {source}")]
    ParseState {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write runtime state {path}: {source}")]
    WriteState {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no execution backend is available: {details}")]
    NoBackendAvailable { details: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn bootstrap_creates_required_directories() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path().join("state"));
        bootstrap_state_root(&paths).expect("bootstrap succeeds");

        for required in paths.required_directories() {
            assert!(
                required.is_dir(),
                "missing directory: {}",
                required.display()
            );
        }
    }

    #[test]
    fn default_state_root_path_uses_home_groupclaw() {
        let _guard = ENV_LOCK.lock().expect("env lock");
        let dir = tempdir().expect("temp dir");
        let old_home = std::env::var_os("HOME");
        std::env::set_var("HOME", dir.path());

        let root = default_state_root_path().expect("resolve state root");
        assert_eq!(root, dir.path().join(".groupclaw"));

        if let Some(value) = old_home {
            std::env::set_var("HOME", value);
        } else {
            std::env::remove_var("HOME");
        }
    }

    #[test]
    fn group_namespace_covers_workspace_session_and_ipc() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path());
        paths.ensure_group_namespace("g1").expect("namespace");
        assert!(paths.group_logs_dir("g1").is_dir());
        assert!(paths.session_dir("g1").is_dir());
        assert!(paths.ipc_messages_dir("g1").is_dir());
        assert!(paths.ipc_tasks_dir("g1").is_dir());
    }
}
