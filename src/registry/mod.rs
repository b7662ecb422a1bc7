pub mod groups;
pub mod sessions;
pub mod tasks;

pub use groups::{GroupRecord, GroupRegistry, SecurityOverrides, TrustLevel};
pub use sessions::{SessionRecord, SessionStore};
pub use tasks::{TaskRecord, TaskStatus, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid registry payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("group `{actor}` is not allowed to register groups")]
    Unauthorized { actor: String },
    #[error("group `{existing}` is already the main group")]
    DuplicateMain { existing: String },
    #[error("folder `{folder}` is already used by group `{owner}`")]
    FolderTaken { folder: String, owner: String },
    #[error("invalid group record: {0}")]
    InvalidRecord(String),
}

pub(crate) fn io_err(path: &std::path::Path, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn parse_err(path: &std::path::Path, source: serde_json::Error) -> RegistryError {
    RegistryError::Parse {
        path: path.display().to_string(),
        source,
    }
}
