use super::{io_err, parse_err, RegistryError};
use crate::config::ExecutionMode;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub token: String,
    pub mode: ExecutionMode,
    pub updated_at: i64,
}

/// Continuation tokens per group, tagged with the backend that issued them.
///
/// A token only resumes under the backend that created it: the two backends
/// keep session state in different directories, so a cross-backend token is
/// treated as absent and the worker starts fresh.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("registry/sessions.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<BTreeMap<String, SessionRecord>, RegistryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        serde_json::from_str(&raw).map_err(|e| parse_err(&self.path, e))
    }

    pub fn get(&self, group_id: &str) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.load()?.remove(group_id))
    }

    pub fn portable_token(
        &self,
        group_id: &str,
        mode: ExecutionMode,
    ) -> Result<Option<String>, RegistryError> {
        Ok(self
            .get(group_id)?
            .filter(|record| record.mode == mode)
            .map(|record| record.token))
    }

    pub fn record(
        &self,
        group_id: &str,
        token: &str,
        mode: ExecutionMode,
    ) -> Result<(), RegistryError> {
        self.mutate(|sessions| {
            sessions.insert(
                group_id.to_string(),
                SessionRecord {
                    token: token.to_string(),
                    mode,
                    updated_at: now_secs(),
                },
            );
        })
    }

    pub fn clear(&self, group_id: &str) -> Result<(), RegistryError> {
        self.mutate(|sessions| {
            sessions.remove(group_id);
        })
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, SessionRecord>),
    ) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut sessions = self.load()?;
        apply(&mut sessions);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        atomic_write_json(&self.path, &sessions).map_err(|e| io_err(&self.path, e))
    }
}
