use super::{io_err, QueueError, WorkItem};
use crate::registry::GroupRegistry;
use crate::runtime::StatePaths;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::logging::{append_event, append_json_line};
use crate::shared::time::{now_rfc3339, now_secs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Final outcome of a work item, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Reply(String),
    /// Succeeded without anything to say in the chat.
    Logged(Option<String>),
    Failed { error: String, attempts: u32 },
    Unavailable(String),
}

impl DeliveryOutcome {
    fn status(&self) -> &'static str {
        match self {
            Self::Reply(_) | Self::Logged(_) => "success",
            Self::Failed { .. } => "error",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Where resolved work goes: the chat for messages, the task log for
/// scheduled tasks.
pub trait Delivery: Send + Sync {
    fn deliver(
        &self,
        group_id: &str,
        item: &WorkItem,
        outcome: &DeliveryOutcome,
    ) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    Reply,
    Error,
    Unavailable,
    /// Worker-initiated message sent over IPC.
    Notice,
}

/// Outbound chat message picked up by the channel adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub group_id: String,
    pub chat_id: String,
    pub in_reply_to: String,
    pub kind: OutboxKind,
    pub text: String,
    /// Host path of an image to send alongside `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub timestamp: i64,
}

/// Writes `message` into the outbox under its conventional file name.
pub fn write_outbox_message(
    paths: &StatePaths,
    message: &OutboxMessage,
) -> Result<PathBuf, QueueError> {
    let dir = paths.outbox_dir();
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let path = dir.join(outbox_filename(
        &message.group_id,
        &message.in_reply_to,
        message.timestamp,
    ));
    atomic_write_json(&path, message).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

pub fn outbox_filename(group_id: &str, item_id: &str, timestamp: i64) -> String {
    format!(
        "{}_{}_{}.json",
        sanitize_filename_component(group_id),
        sanitize_filename_component(item_id),
        timestamp
    )
}

fn sanitize_filename_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct OutboxDelivery {
    paths: StatePaths,
    registry: GroupRegistry,
}

impl OutboxDelivery {
    pub fn new(paths: StatePaths) -> Self {
        let registry = GroupRegistry::new(&paths.root);
        Self { paths, registry }
    }

    fn write_outbox(
        &self,
        group_id: &str,
        item: &WorkItem,
        kind: OutboxKind,
        text: &str,
    ) -> Result<PathBuf, QueueError> {
        let message = OutboxMessage {
            group_id: group_id.to_string(),
            chat_id: group_id.to_string(),
            in_reply_to: item.id.clone(),
            kind,
            text: text.to_string(),
            attachment: None,
            timestamp: now_secs(),
        };
        write_outbox_message(&self.paths, &message)
    }

    fn append_task_log(&self, group_id: &str, item: &WorkItem, outcome: &DeliveryOutcome) {
        let folder = match self.registry.get(group_id) {
            Ok(Some(group)) => group.folder.to_string(),
            _ => {
                append_event(
                    &self.paths.runtime_log_path(),
                    "warn",
                    "delivery.task_log_skipped",
                    &format!("group `{group_id}` is not registered; task `{}` outcome not logged", item.id),
                );
                return;
            }
        };
        let (result, error, attempts) = match outcome {
            DeliveryOutcome::Reply(text) => (Some(text.clone()), None, None),
            DeliveryOutcome::Logged(log) => (log.clone(), None, None),
            DeliveryOutcome::Failed { error, attempts } => (None, Some(error.clone()), Some(*attempts)),
            DeliveryOutcome::Unavailable(message) => (None, Some(message.clone()), None),
        };
        append_json_line(
            &self.paths.task_log_path(&folder),
            &serde_json::json!({
                "timestamp": now_rfc3339(),
                "taskId": item.task_id(),
                "itemId": item.id,
                "status": outcome.status(),
                "result": result,
                "error": error,
                "attempts": attempts,
            }),
        );
    }
}

impl Delivery for OutboxDelivery {
    fn deliver(
        &self,
        group_id: &str,
        item: &WorkItem,
        outcome: &DeliveryOutcome,
    ) -> Result<(), QueueError> {
        if item.is_task() {
            self.append_task_log(group_id, item, outcome);
        }
        match outcome {
            DeliveryOutcome::Reply(text) => {
                self.write_outbox(group_id, item, OutboxKind::Reply, text)?;
            }
            DeliveryOutcome::Logged(_) => {}
            // Scheduled-task failures stay in the task log; nobody is waiting.
            DeliveryOutcome::Failed { .. } | DeliveryOutcome::Unavailable(_) if item.is_task() => {}
            DeliveryOutcome::Failed { error, attempts } => {
                let text = format!("Sorry, I could not handle that after {attempts} attempt(s): {error}");
                self.write_outbox(group_id, item, OutboxKind::Error, &text)?;
            }
            DeliveryOutcome::Unavailable(message) => {
                self.write_outbox(group_id, item, OutboxKind::Unavailable, message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{GroupRecord, TrustLevel};
    use crate::shared::ids::GroupFolder;
    use tempfile::tempdir;

    fn outbox_files(paths: &StatePaths) -> Vec<OutboxMessage> {
        let mut out = Vec::new();
        for entry in fs::read_dir(paths.outbox_dir()).expect("read outbox") {
            let path = entry.expect("entry").path();
            let raw = fs::read_to_string(path).expect("read");
            out.push(serde_json::from_str(&raw).expect("parse"));
        }
        out
    }

    #[test]
    fn outbox_filename_sanitizes_components() {
        assert_eq!(outbox_filename("g1", "m/1", 7), "g1_m_1_7.json");
    }

    #[test]
    fn replies_and_unavailability_reach_the_outbox() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let delivery = OutboxDelivery::new(paths.clone());

        let item = WorkItem::message("m1", "g1", "hello");
        delivery
            .deliver("g1", &item, &DeliveryOutcome::Reply("hi there".to_string()))
            .expect("deliver");
        delivery
            .deliver("g1", &WorkItem::message("m2", "g1", "again"), &DeliveryOutcome::Logged(None))
            .expect("deliver");
        delivery
            .deliver(
                "g1",
                &WorkItem::message("m3", "g1", "x"),
                &DeliveryOutcome::Unavailable("isolated backend is down".to_string()),
            )
            .expect("deliver");

        let mut messages = outbox_files(&paths);
        messages.sort_by(|a, b| a.in_reply_to.cmp(&b.in_reply_to));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, OutboxKind::Reply);
        assert_eq!(messages[0].text, "hi there");
        assert_eq!(messages[1].kind, OutboxKind::Unavailable);
    }

    #[test]
    fn task_failures_go_to_the_task_log_only() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let registry = GroupRegistry::new(dir.path());
        registry
            .bootstrap_main(GroupRecord {
                id: "main-chat".to_string(),
                name: "Main".to_string(),
                folder: GroupFolder::parse("main").expect("folder"),
                trust: TrustLevel::Main,
                execution_mode: None,
                trigger: String::new(),
                security: None,
                added_at: 0,
            })
            .expect("bootstrap");
        let delivery = OutboxDelivery::new(paths.clone());

        let item = WorkItem::task("t-run-1", "main-chat", "daily-report", "summarize");
        delivery
            .deliver(
                "main-chat",
                &item,
                &DeliveryOutcome::Failed {
                    error: "boom".to_string(),
                    attempts: 5,
                },
            )
            .expect("deliver");

        assert!(!paths.outbox_dir().exists() || outbox_files(&paths).is_empty());
        let log = fs::read_to_string(paths.task_log_path("main")).expect("task log");
        let entry: serde_json::Value = serde_json::from_str(log.trim()).expect("json");
        assert_eq!(entry["taskId"], "daily-report");
        assert_eq!(entry["status"], "error");
        assert_eq!(entry["attempts"], 5);
    }
}
