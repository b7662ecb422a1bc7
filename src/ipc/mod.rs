pub mod channel;
pub mod health;
pub mod message;
pub mod watcher;

pub use channel::{normalize_lexically, IpcChannel};
pub use health::{build_health_snapshot, write_health_snapshot, BackendHealth, GroupHealth, HealthSnapshot};
pub use message::IpcMessage;
pub use watcher::{authorize, IpcContext, IpcHandler, IpcScanReport, IpcWatcher};

use crate::queue::QueueError;
use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("ipc io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("group `{group}` may not write to `{path}`: outside its ipc namespace")]
    OutsideNamespace { group: String, path: String },
    #[error("group `{group}` is not allowed to {action}")]
    Unauthorized { group: String, action: String },
    #[error("task `{task_id}` not found")]
    TaskNotFound { task_id: String },
    #[error("invalid ipc request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Outbox(#[from] QueueError),
}

pub(crate) fn io_err(path: &std::path::Path, source: std::io::Error) -> IpcError {
    IpcError::Io {
        path: path.display().to_string(),
        source,
    }
}
