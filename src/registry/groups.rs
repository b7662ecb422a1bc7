use super::{io_err, parse_err, RegistryError};
use crate::config::ExecutionMode;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::GroupFolder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Main,
    #[default]
    Standard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityOverrides {
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub sandbox: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub folder: GroupFolder,
    #[serde(default)]
    pub trust: TrustLevel,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub security: Option<SecurityOverrides>,
    #[serde(default)]
    pub added_at: i64,
}

impl GroupRecord {
    pub fn is_main(&self) -> bool {
        self.trust == TrustLevel::Main
    }
}

/// File-backed group registration set. Every read goes to disk so a
/// re-registration is visible to the next dispatch without a restart.
#[derive(Debug, Clone)]
pub struct GroupRegistry {
    path: PathBuf,
}

impl GroupRegistry {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("registry/groups.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<BTreeMap<String, GroupRecord>, RegistryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        serde_json::from_str(&raw).map_err(|e| parse_err(&self.path, e))
    }

    pub fn get(&self, group_id: &str) -> Result<Option<GroupRecord>, RegistryError> {
        Ok(self.load()?.remove(group_id))
    }

    pub fn all(&self) -> Result<Vec<GroupRecord>, RegistryError> {
        Ok(self.load()?.into_values().collect())
    }

    pub fn main_group(&self) -> Result<Option<GroupRecord>, RegistryError> {
        Ok(self.load()?.into_values().find(GroupRecord::is_main))
    }

    pub fn find_by_folder(&self, folder: &str) -> Result<Option<GroupRecord>, RegistryError> {
        Ok(self
            .load()?
            .into_values()
            .find(|record| record.folder.as_str() == folder))
    }

    /// Administrative registration. Only the main group may register or
    /// re-register groups; records are overwritten, never removed.
    pub fn register(&self, actor: &GroupRecord, record: GroupRecord) -> Result<(), RegistryError> {
        if !actor.is_main() {
            return Err(RegistryError::Unauthorized {
                actor: actor.id.clone(),
            });
        }
        self.upsert(record)
    }

    /// Installs the first main group. Refused once any main group exists.
    pub fn bootstrap_main(&self, record: GroupRecord) -> Result<(), RegistryError> {
        if !record.is_main() {
            return Err(RegistryError::InvalidRecord(
                "bootstrap record must have `main` trust".to_string(),
            ));
        }
        if let Some(existing) = self.main_group()? {
            if existing.id != record.id {
                return Err(RegistryError::DuplicateMain {
                    existing: existing.id,
                });
            }
        }
        self.upsert(record)
    }

    fn upsert(&self, record: GroupRecord) -> Result<(), RegistryError> {
        if record.id.trim().is_empty() {
            return Err(RegistryError::InvalidRecord(
                "group id must be non-empty".to_string(),
            ));
        }
        let mut groups = self.load()?;
        if record.is_main() {
            if let Some(existing) = groups
                .values()
                .find(|existing| existing.is_main() && existing.id != record.id)
            {
                return Err(RegistryError::DuplicateMain {
                    existing: existing.id.clone(),
                });
            }
        } else if groups
            .get(&record.id)
            .map(GroupRecord::is_main)
            .unwrap_or(false)
        {
            return Err(RegistryError::InvalidRecord(format!(
                "main group `{}` cannot be demoted",
                record.id
            )));
        }
        if let Some(owner) = groups
            .values()
            .find(|existing| existing.folder == record.folder && existing.id != record.id)
        {
            return Err(RegistryError::FolderTaken {
                folder: record.folder.to_string(),
                owner: owner.id.clone(),
            });
        }

        groups.insert(record.id.clone(), record);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        atomic_write_json(&self.path, &groups).map_err(|e| io_err(&self.path, e))
    }
}
