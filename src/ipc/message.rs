use crate::config::ExecutionMode;
use crate::registry::SecurityOverrides;
use serde::{Deserialize, Serialize};

/// Envelope of one IPC file. The source group is never part of the payload;
/// it is the namespace directory the file was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum IpcMessage {
    SendMessage {
        chat_id: String,
        text: String,
    },
    SendImage {
        chat_id: String,
        path: String,
        #[serde(default)]
        caption: Option<String>,
    },
    CreateTask {
        /// Defaults to the source group.
        #[serde(default)]
        target_group: Option<String>,
        prompt: String,
        schedule: String,
        #[serde(default)]
        task_id: Option<String>,
    },
    PauseTask {
        task_id: String,
    },
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    RegisterGroup {
        group_id: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: String,
        #[serde(default)]
        execution_mode: Option<ExecutionMode>,
        #[serde(default)]
        security: Option<SecurityOverrides>,
    },
    SystemHealth,
    SandboxViolation {
        group_id: String,
        group_folder: String,
        run_id: String,
        mode: ExecutionMode,
        denials: Vec<String>,
        audit_log: String,
    },
}

impl IpcMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::SendImage { .. } => "send_image",
            Self::CreateTask { .. } => "create_task",
            Self::PauseTask { .. } => "pause_task",
            Self::ResumeTask { .. } => "resume_task",
            Self::CancelTask { .. } => "cancel_task",
            Self::RegisterGroup { .. } => "register_group",
            Self::SystemHealth => "system_health",
            Self::SandboxViolation { .. } => "sandbox_violation",
        }
    }

    /// Messages and images go under `messages/`; everything else is a
    /// command under `tasks/`.
    pub fn subdirectory(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } | Self::SendImage { .. } | Self::SandboxViolation { .. } => {
                "messages"
            }
            _ => "tasks",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_use_type_tags_and_camel_case_fields() {
        let message: IpcMessage =
            serde_json::from_str(r#"{"type":"send_message","chatId":"g1","text":"hi"}"#)
                .expect("parse");
        assert_eq!(
            message,
            IpcMessage::SendMessage {
                chat_id: "g1".to_string(),
                text: "hi".to_string()
            }
        );
        assert_eq!(message.subdirectory(), "messages");

        let health: IpcMessage =
            serde_json::from_str(r#"{"type":"system_health"}"#).expect("parse");
        assert_eq!(health.kind(), "system_health");
        assert_eq!(health.subdirectory(), "tasks");

        let register: IpcMessage = serde_json::from_str(
            r#"{"type":"register_group","groupId":"g9","name":"Nine","folder":"g9","executionMode":"host-native"}"#,
        )
        .expect("parse");
        match register {
            IpcMessage::RegisterGroup { execution_mode, .. } => {
                assert_eq!(execution_mode, Some(ExecutionMode::HostNative))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_fail_to_parse() {
        assert!(serde_json::from_str::<IpcMessage>(r#"{"type":"rm_rf"}"#).is_err());
    }
}
