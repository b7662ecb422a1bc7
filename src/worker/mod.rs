//! Helpers for the worker side of the stdin/stdout protocol. The same worker
//! binary runs under both backends; only its environment differs.

use crate::runner::host_native::{
    ENV_GLOBAL_DIR, ENV_GROUP_DIR, ENV_IPC_DIR, ENV_MODE, ENV_PROJECT_DIR, ENV_SESSION_DIR,
};
use crate::runner::isolated::{
    CONTAINER_GLOBAL_DIR, CONTAINER_GROUP_DIR, CONTAINER_IPC_DIR, CONTAINER_PROJECT_DIR,
    CONTAINER_SESSION_DIR,
};
use crate::runner::protocol::frame_result;
use crate::runner::{ExecutionRequest, ExecutionResult};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

pub const SCHEDULED_TASK_PREFIX: &str =
    "[SCHEDULED TASK - no user is present. Report results with the send_message tool if they need attention.]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Container,
    Host,
}

impl WorkerMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "container" => Some(Self::Container),
            "host" => Some(Self::Host),
            _ => None,
        }
    }
}

/// Filesystem locations a worker operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPaths {
    pub group_dir: PathBuf,
    pub global_dir: PathBuf,
    pub project_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub session_dir: PathBuf,
    pub mode: WorkerMode,
    /// Values that were present but rejected.
    pub warnings: Vec<String>,
}

impl WorkerPaths {
    /// Reads the injected locations, falling back to the container layout
    /// for anything unset or not absolute.
    pub fn from_env_map(env: &BTreeMap<String, String>) -> Self {
        let mut warnings = Vec::new();
        let mut dir = |key: &str, fallback: &str| -> PathBuf {
            match env.get(key).map(|value| value.trim()) {
                None | Some("") => PathBuf::from(fallback),
                Some(value) if PathBuf::from(value).is_absolute() => PathBuf::from(value),
                Some(value) => {
                    warnings.push(format!(
                        "{key}=`{value}` is not an absolute path; using {fallback}"
                    ));
                    PathBuf::from(fallback)
                }
            }
        };
        let group_dir = dir(ENV_GROUP_DIR, CONTAINER_GROUP_DIR);
        let global_dir = dir(ENV_GLOBAL_DIR, CONTAINER_GLOBAL_DIR);
        let project_dir = dir(ENV_PROJECT_DIR, CONTAINER_PROJECT_DIR);
        let ipc_dir = dir(ENV_IPC_DIR, CONTAINER_IPC_DIR);
        let session_dir = dir(ENV_SESSION_DIR, CONTAINER_SESSION_DIR);

        let mode = match env.get(ENV_MODE) {
            None => WorkerMode::Container,
            Some(raw) => WorkerMode::parse(raw).unwrap_or_else(|| {
                warnings.push(format!("{ENV_MODE}=`{raw}` is not `container` or `host`; using container"));
                WorkerMode::Container
            }),
        };
        Self {
            group_dir,
            global_dir,
            project_dir,
            ipc_dir,
            session_dir,
            mode,
            warnings,
        }
    }

    /// Like `from_env_map` over the process environment. Warnings go to
    /// stderr, which the coordinator streams into the run log.
    pub fn from_env() -> Self {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let paths = Self::from_env_map(&env);
        for warning in &paths.warnings {
            eprintln!("warning: {warning}");
        }
        paths
    }

    pub fn ipc_messages_dir(&self) -> PathBuf {
        self.ipc_dir.join("messages")
    }

    pub fn ipc_tasks_dir(&self) -> PathBuf {
        self.ipc_dir.join("tasks")
    }
}

/// Prompt as the agent should see it. Scheduled tasks are marked so the
/// agent does not wait on a human.
pub fn framed_prompt(request: &ExecutionRequest) -> String {
    if request.is_scheduled_task {
        format!("{SCHEDULED_TASK_PREFIX}\n\n{}", request.prompt)
    } else {
        request.prompt.clone()
    }
}

pub fn read_request(reader: impl Read) -> Result<ExecutionRequest, serde_json::Error> {
    serde_json::from_reader(reader)
}

/// Writes `result` between the output sentinels and flushes.
pub fn emit_result(mut out: impl Write, result: &ExecutionResult) -> std::io::Result<()> {
    let framed = frame_result(result).map_err(std::io::Error::other)?;
    out.write_all(framed.as_bytes())?;
    out.flush()
}
