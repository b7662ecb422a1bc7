use super::{io_err, parse_err, RegistryError};
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Cancelled,
}

/// A scheduled task definition. When it is due is the scheduler's business;
/// this only records what to run, for which group, and whether it may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub group_id: String,
    pub prompt: String,
    pub schedule: String,
    pub status: TaskStatus,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("registry/tasks.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<BTreeMap<String, TaskRecord>, RegistryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        serde_json::from_str(&raw).map_err(|e| parse_err(&self.path, e))
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, RegistryError> {
        Ok(self.load()?.remove(task_id))
    }

    pub fn for_group(&self, group_id: &str) -> Result<Vec<TaskRecord>, RegistryError> {
        Ok(self
            .load()?
            .into_values()
            .filter(|task| task.group_id == group_id)
            .collect())
    }

    pub fn create(&self, record: TaskRecord) -> Result<(), RegistryError> {
        self.mutate(|tasks| {
            if tasks.contains_key(&record.id) {
                return Err(RegistryError::InvalidRecord(format!(
                    "task `{}` already exists",
                    record.id
                )));
            }
            tasks.insert(record.id.clone(), record);
            Ok(())
        })
    }

    /// Cancelled tasks stay cancelled.
    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<TaskRecord, RegistryError> {
        self.mutate(|tasks| {
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| RegistryError::InvalidRecord(format!("task `{task_id}` not found")))?;
            if task.status == TaskStatus::Cancelled && status != TaskStatus::Cancelled {
                return Err(RegistryError::InvalidRecord(format!(
                    "task `{task_id}` is cancelled"
                )));
            }
            task.status = status;
            task.updated_at = now_secs();
            Ok(task.clone())
        })
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut BTreeMap<String, TaskRecord>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tasks = self.load()?;
        let out = apply(&mut tasks)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        atomic_write_json(&self.path, &tasks).map_err(|e| io_err(&self.path, e))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task(id: &str, group_id: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            group_id: group_id.to_string(),
            prompt: "summarize".to_string(),
            schedule: "0 9 * * *".to_string(),
            status: TaskStatus::Active,
            created_by: group_id.to_string(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn status_changes_persist_and_cancel_is_final() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::new(dir.path());
        store.create(task("t1", "g1")).expect("create");
        assert!(store.create(task("t1", "g1")).is_err());

        store.set_status("t1", TaskStatus::Paused).expect("pause");
        assert_eq!(
            store.get("t1").expect("get").map(|t| t.status),
            Some(TaskStatus::Paused)
        );
        store.set_status("t1", TaskStatus::Cancelled).expect("cancel");
        assert!(store.set_status("t1", TaskStatus::Active).is_err());
        assert_eq!(store.for_group("g1").expect("list").len(), 1);
        assert!(store.for_group("g2").expect("list").is_empty());
    }
}
