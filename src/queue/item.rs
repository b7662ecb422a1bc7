use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkKind {
    Message {
        #[serde(default)]
        sender: Option<String>,
    },
    /// A scheduled task the external scheduler decided is due.
    Task {
        #[serde(rename = "taskId")]
        task_id: String,
    },
}

/// One unit of inbound work for a group, as dropped into the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub group_id: String,
    pub kind: WorkKind,
    pub prompt: String,
    #[serde(default)]
    pub received_at: i64,
    /// Inbox file backing this item; removed once the item is resolved.
    #[serde(skip)]
    pub claim_path: Option<PathBuf>,
}

impl WorkItem {
    pub fn message(id: &str, group_id: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            group_id: group_id.to_string(),
            kind: WorkKind::Message { sender: None },
            prompt: prompt.to_string(),
            received_at: crate::shared::time::now_secs(),
            claim_path: None,
        }
    }

    pub fn task(id: &str, group_id: &str, task_id: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            group_id: group_id.to_string(),
            kind: WorkKind::Task {
                task_id: task_id.to_string(),
            },
            prompt: prompt.to_string(),
            received_at: crate::shared::time::now_secs(),
            claim_path: None,
        }
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, WorkKind::Task { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match &self.kind {
            WorkKind::Task { task_id } => Some(task_id),
            WorkKind::Message { .. } => None,
        }
    }
}
