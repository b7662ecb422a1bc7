use crate::config::{ExecutionMode, IntegrationServer};
use crate::security::SecurityProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub mod dispatch;
pub mod gate;
pub mod host_native;
pub mod isolated;
pub mod process;
pub mod protocol;

pub use dispatch::{resolve_mode, DispatchOutcome, Dispatcher};
pub use gate::{validate_startup, BackendProbe, StartupReport};
pub use host_native::{filter_worker_env, HostNativeRunner, WORKER_ENV_ALLOWLIST};
pub use isolated::{IsolatedRunner, Mount};
pub use process::{
    run_worker, RunContext, SpawnedWorker, WorkerBackend, WorkerProcess, WorkerRun,
};
pub use protocol::{parse_framed_output, OUTPUT_END_MARKER, OUTPUT_START_MARKER};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{mode} backend is unavailable: {reason}")]
    Unavailable { mode: ExecutionMode, reason: String },
    #[error("failed to spawn {mode} worker `{program}`: {source}")]
    Spawn {
        mode: ExecutionMode,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid mount `{path}`: {reason}")]
    InvalidMount { path: String, reason: String },
    #[error("failed to signal worker {target}: {reason}")]
    Signal { target: String, reason: String },
    #[error("sandbox setup failed: {0}")]
    Sandbox(#[from] crate::security::SandboxError),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> RunnerError {
    RunnerError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// One invocation's input, written as JSON to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub run_id: String,
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_id: String,
    pub is_main: bool,
    #[serde(default)]
    pub is_scheduled_task: bool,
    pub security: SecurityProfile,
    #[serde(default)]
    pub integration_servers: BTreeMap<String, IntegrationServer>,
}

impl ExecutionRequest {
    /// Same invocation, fresh conversational state.
    pub fn without_session(&self) -> Self {
        Self {
            session_id: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Message,
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub output_type: OutputType,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub internal_log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub result: Option<ResultPayload>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success_message(text: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Success,
            result: Some(ResultPayload {
                output_type: OutputType::Message,
                user_message: Some(text.into()),
                internal_log: None,
            }),
            new_session_id: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Text that must be delivered to the chat, if any.
    pub fn deliverable_message(&self) -> Option<&str> {
        let payload = self.result.as_ref()?;
        if payload.output_type != OutputType::Message {
            return None;
        }
        payload
            .user_message
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }

    /// Enforces the message-intent contract: a `message` payload without a
    /// non-empty body is downgraded to `log`. Returns a warning when it
    /// downgraded.
    pub fn normalize(&mut self) -> Option<String> {
        let payload = self.result.as_mut()?;
        if payload.output_type != OutputType::Message {
            return None;
        }
        let blank = payload
            .user_message
            .as_deref()
            .map(|text| text.trim().is_empty())
            .unwrap_or(true);
        if !blank {
            return None;
        }
        payload.output_type = OutputType::Log;
        payload.user_message = None;
        Some("worker reported outputType=message with an empty body; downgraded to log".to_string())
    }
}
