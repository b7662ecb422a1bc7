use super::process::{send_signal, take_pipes, ChildHandle, SpawnedWorker, WorkerBackend, WorkerProcess};
use super::{ExecutionRequest, RunnerError};
use crate::config::{ExecutionMode, IsolatedSettings, Settings};
use crate::registry::GroupRecord;
use crate::runtime::StatePaths;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const CONTAINER_GROUP_DIR: &str = "/workspace/group";
pub const CONTAINER_GLOBAL_DIR: &str = "/workspace/global";
pub const CONTAINER_PROJECT_DIR: &str = "/workspace/project";
pub const CONTAINER_IPC_DIR: &str = "/workspace/ipc";
pub const CONTAINER_SESSION_DIR: &str = "/workspace/session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    fn new(host: PathBuf, container: &str, read_only: bool) -> Self {
        Self {
            host,
            container: container.to_string(),
            read_only,
        }
    }

    fn to_volume_arg(&self) -> Result<String, RunnerError> {
        let host = self.host.display().to_string();
        if host.contains(':') || host.contains(',') {
            return Err(RunnerError::InvalidMount {
                path: host,
                reason: "host path must not contain ':' or ','".to_string(),
            });
        }
        Ok(if self.read_only {
            format!("{host}:{}:ro", self.container)
        } else {
            format!("{host}:{}", self.container)
        })
    }
}

/// Runs workers inside a fresh container per invocation.
pub struct IsolatedRunner {
    settings: IsolatedSettings,
    project_root: PathBuf,
    stop_grace: Duration,
    paths: StatePaths,
}

impl IsolatedRunner {
    pub fn new(settings: &Settings, paths: StatePaths) -> Self {
        Self {
            settings: settings.isolated.clone(),
            project_root: settings.project_root.clone(),
            stop_grace: settings.timeouts.stop_grace(),
            paths,
        }
    }

    /// Host directories visible to the worker. Main sees the project root;
    /// everyone else sees the shared global namespace read-only.
    pub fn mounts_for(&self, group: &GroupRecord) -> Vec<Mount> {
        let folder = group.folder.as_str();
        let mut mounts = Vec::new();
        if group.is_main() {
            mounts.push(Mount::new(
                self.project_root.clone(),
                CONTAINER_PROJECT_DIR,
                false,
            ));
        }
        mounts.push(Mount::new(
            self.paths.group_dir(folder),
            CONTAINER_GROUP_DIR,
            false,
        ));
        if !group.is_main() {
            mounts.push(Mount::new(
                self.paths.global_dir(),
                CONTAINER_GLOBAL_DIR,
                true,
            ));
        }
        mounts.push(Mount::new(
            self.paths.session_dir(folder),
            CONTAINER_SESSION_DIR,
            false,
        ));
        mounts.push(Mount::new(
            self.paths.ipc_namespace(folder),
            CONTAINER_IPC_DIR,
            false,
        ));
        mounts
    }

    pub fn container_name(group: &GroupRecord, run_id: &str) -> String {
        format!("groupclaw-{}-{run_id}", group.folder)
    }

    pub fn run_args(&self, group: &GroupRecord, run_id: &str) -> Result<Vec<String>, RunnerError> {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(group, run_id),
        ];
        for mount in self.mounts_for(group) {
            args.push("-v".to_string());
            args.push(mount.to_volume_arg()?);
        }
        args.extend(self.settings.extra_run_args.iter().cloned());
        args.push(self.settings.image.clone());
        Ok(args)
    }

    fn prepare_mount_sources(&self, group: &GroupRecord) -> Result<(), RunnerError> {
        for mount in self.mounts_for(group) {
            if mount.host == self.project_root {
                continue;
            }
            fs::create_dir_all(&mount.host)
                .map_err(|source| super::io_error(&mount.host, source))?;
        }
        Ok(())
    }
}

impl WorkerBackend for IsolatedRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Isolated
    }

    fn check_available(&self) -> Result<(), RunnerError> {
        let output = Command::new(&self.settings.runtime_bin)
            .arg("info")
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(RunnerError::Unavailable {
                mode: ExecutionMode::Isolated,
                reason: format!(
                    "`{} info` failed: {}",
                    self.settings.runtime_bin,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
            Err(err) => Err(RunnerError::Unavailable {
                mode: ExecutionMode::Isolated,
                reason: format!(
                    "container runtime `{}` cannot be started: {err}",
                    self.settings.runtime_bin
                ),
            }),
        }
    }

    fn output_limit(&self) -> Option<usize> {
        Some(self.settings.max_output_bytes)
    }

    fn spawn(
        &self,
        group: &GroupRecord,
        request: &ExecutionRequest,
    ) -> Result<SpawnedWorker, RunnerError> {
        self.prepare_mount_sources(group)?;
        let name = Self::container_name(group, &request.run_id);
        let mut command = Command::new(&self.settings.runtime_bin);
        command
            .args(self.run_args(group, &request.run_id)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RunnerError::Unavailable {
                    mode: ExecutionMode::Isolated,
                    reason: format!(
                        "container runtime `{}` not found",
                        self.settings.runtime_bin
                    ),
                }
            } else {
                RunnerError::Spawn {
                    mode: ExecutionMode::Isolated,
                    program: self.settings.runtime_bin.clone(),
                    source,
                }
            }
        })?;
        let (stdin, stdout, stderr) = take_pipes(&mut child, &name)?;
        let process = ContainerProcess {
            handle: ChildHandle::new(child),
            runtime_bin: self.settings.runtime_bin.clone(),
            name,
            stop_grace: self.stop_grace,
        };
        Ok(SpawnedWorker {
            process: Arc::new(process),
            stdin,
            stdout,
            stderr,
        })
    }
}

struct ContainerProcess {
    handle: ChildHandle,
    runtime_bin: String,
    name: String,
    stop_grace: Duration,
}

impl WorkerProcess for ContainerProcess {
    fn label(&self) -> String {
        format!("container {}", self.name)
    }

    fn signal_stop(&self) -> Result<(), RunnerError> {
        let mut stop = Command::new(&self.runtime_bin)
            .arg("stop")
            .arg("-t")
            .arg(self.stop_grace.as_secs().to_string())
            .arg(&self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| RunnerError::Signal {
                target: self.name.clone(),
                reason: err.to_string(),
            })?;
        // `stop` blocks for the whole grace period; reap it off-thread.
        thread::spawn(move || {
            let _ = stop.wait();
        });
        Ok(())
    }

    fn force_kill(&self) -> Result<(), RunnerError> {
        let killed = Command::new(&self.runtime_bin)
            .arg("kill")
            .arg(&self.name)
            .stdin(Stdio::null())
            .output();
        let _ = send_signal("KILL", &format!("-{}", self.handle.pid()));
        self.handle.kill();
        match killed {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(RunnerError::Signal {
                target: self.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Err(err) => Err(RunnerError::Signal {
                target: self.name.clone(),
                reason: err.to_string(),
            }),
        }
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>, RunnerError> {
        self.handle.try_wait(&self.name)
    }
}
