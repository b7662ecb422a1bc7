use super::process::{send_signal, take_pipes, ChildHandle, SpawnedWorker, WorkerBackend, WorkerProcess};
use super::{ExecutionRequest, RunnerError};
use crate::config::{ExecutionMode, HostNativeSettings, Settings};
use crate::registry::GroupRecord;
use crate::runtime::StatePaths;
use crate::security::{default_sensitive_paths, wrap_worker_command, SandboxSpec};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

/// Host variables a worker may inherit. Everything else is stripped.
pub const WORKER_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "TZ",
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_AUTH_TOKEN",
    "ANTHROPIC_BASE_URL",
    "ANTHROPIC_MODEL",
    "CLAUDE_CODE_OAUTH_TOKEN",
];

pub const ENV_GROUP_DIR: &str = "GROUPCLAW_GROUP_DIR";
pub const ENV_GLOBAL_DIR: &str = "GROUPCLAW_GLOBAL_DIR";
pub const ENV_PROJECT_DIR: &str = "GROUPCLAW_PROJECT_DIR";
pub const ENV_IPC_DIR: &str = "GROUPCLAW_IPC_DIR";
pub const ENV_SESSION_DIR: &str = "GROUPCLAW_SESSION_DIR";
pub const ENV_MODE: &str = "GROUPCLAW_MODE";
pub const ENV_RUN_ID: &str = "GROUPCLAW_RUN_ID";

pub fn filter_worker_env(
    host_env: &BTreeMap<String, String>,
    passthrough: &[String],
) -> BTreeMap<String, String> {
    host_env
        .iter()
        .filter(|(key, _)| {
            WORKER_ENV_ALLOWLIST.contains(&key.as_str())
                || passthrough.iter().any(|extra| extra == *key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Runs workers as host processes, optionally inside the OS sandbox.
pub struct HostNativeRunner {
    settings: HostNativeSettings,
    state_root: PathBuf,
    project_root: PathBuf,
    paths: StatePaths,
    host_env: BTreeMap<String, String>,
}

impl HostNativeRunner {
    pub fn new(settings: &Settings, paths: StatePaths, host_env: BTreeMap<String, String>) -> Self {
        Self {
            settings: settings.host_native.clone(),
            state_root: settings.state_root.clone(),
            project_root: settings.project_root.clone(),
            paths,
            host_env,
        }
    }

    pub fn from_process_env(settings: &Settings, paths: StatePaths) -> Self {
        Self::new(settings, paths, std::env::vars().collect())
    }

    /// Filtered host environment plus the namespace paths the worker needs,
    /// since it has no fixed mount points.
    pub fn worker_env(&self, group: &GroupRecord, request: &ExecutionRequest) -> BTreeMap<String, String> {
        let folder = group.folder.as_str();
        let mut env = filter_worker_env(&self.host_env, &self.settings.env_passthrough);
        let mut inject = |key: &str, path: PathBuf| {
            env.insert(key.to_string(), path.display().to_string());
        };
        inject(ENV_GROUP_DIR, self.paths.group_dir(folder));
        inject(ENV_GLOBAL_DIR, self.paths.global_dir());
        inject(ENV_IPC_DIR, self.paths.ipc_namespace(folder));
        inject(ENV_SESSION_DIR, self.paths.session_dir(folder));
        if group.is_main() {
            inject(ENV_PROJECT_DIR, self.project_root.clone());
        }
        env.insert(ENV_MODE.to_string(), "host".to_string());
        env.insert(ENV_RUN_ID.to_string(), request.run_id.clone());
        env
    }

    /// Denies credential stores and makes the orchestrator state read-only
    /// apart from the group's own directories.
    pub fn sandbox_spec(&self, group: &GroupRecord) -> SandboxSpec {
        let folder = group.folder.as_str();
        let mut deny_paths = self
            .host_env
            .get("HOME")
            .map(|home| default_sensitive_paths(Path::new(home)))
            .unwrap_or_default();
        let mut deny_network_outbound = false;
        if let Some(security) = &self.settings.security {
            deny_paths.extend(security.deny_paths.iter().cloned());
            deny_network_outbound = security.deny_network_outbound;
        }
        SandboxSpec {
            deny_paths,
            read_only_roots: vec![self.state_root.clone(), self.project_root.clone()],
            writable: vec![
                self.paths.group_dir(folder),
                self.paths.session_dir(folder),
                self.paths.ipc_namespace(folder),
            ],
            deny_network_outbound,
        }
    }

    fn resolve_program(&self, program: &str) -> Option<PathBuf> {
        if program.contains('/') {
            let path = PathBuf::from(program);
            return path.is_file().then_some(path);
        }
        let search = self.host_env.get("PATH")?;
        search
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(program))
            .find(|candidate| candidate.is_file())
    }
}

impl WorkerBackend for HostNativeRunner {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::HostNative
    }

    fn check_available(&self) -> Result<(), RunnerError> {
        let program = self
            .settings
            .worker_command
            .first()
            .map(String::as_str)
            .unwrap_or_default();
        match self.resolve_program(program) {
            Some(_) => Ok(()),
            None => Err(RunnerError::Unavailable {
                mode: ExecutionMode::HostNative,
                reason: format!("worker program `{program}` not found"),
            }),
        }
    }

    fn output_limit(&self) -> Option<usize> {
        None
    }

    fn spawn(
        &self,
        group: &GroupRecord,
        request: &ExecutionRequest,
    ) -> Result<SpawnedWorker, RunnerError> {
        let folder = group.folder.as_str();
        for dir in [
            self.paths.group_dir(folder),
            self.paths.session_dir(folder),
            self.paths.ipc_namespace(folder),
        ] {
            fs::create_dir_all(&dir).map_err(|source| super::io_error(&dir, source))?;
        }

        let spec = request
            .security
            .sandbox_enabled()
            .then(|| self.sandbox_spec(group));
        let (program, args) = wrap_worker_command(
            &self.settings.worker_command,
            self.settings.sandbox_wrapper,
            self.settings.sandbox_wrapper_bin.as_deref(),
            spec.as_ref(),
        )?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(self.paths.group_dir(folder))
            .env_clear()
            .envs(self.worker_env(group, request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                RunnerError::Unavailable {
                    mode: ExecutionMode::HostNative,
                    reason: format!("`{program}` not found"),
                }
            } else {
                RunnerError::Spawn {
                    mode: ExecutionMode::HostNative,
                    program: program.clone(),
                    source,
                }
            }
        })?;
        let label = format!("host worker {} ({program})", child.id());
        let (stdin, stdout, stderr) = take_pipes(&mut child, &label)?;
        Ok(SpawnedWorker {
            process: Arc::new(HostProcess {
                handle: ChildHandle::new(child),
                label,
            }),
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Host worker running as leader of its own process group, so signals
/// reach the sandbox wrapper and everything it started.
struct HostProcess {
    handle: ChildHandle,
    label: String,
}

impl HostProcess {
    fn group_target(&self) -> String {
        format!("-{}", self.handle.pid())
    }
}

impl WorkerProcess for HostProcess {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn signal_stop(&self) -> Result<(), RunnerError> {
        send_signal("TERM", &self.group_target())
    }

    fn force_kill(&self) -> Result<(), RunnerError> {
        let result = send_signal("KILL", &self.group_target());
        self.handle.kill();
        result
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>, RunnerError> {
        self.handle.try_wait(&self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TrustLevel;
    use crate::security::resolve_security_profile;
    use crate::shared::ids::GroupFolder;

    fn settings() -> Settings {
        serde_yaml::from_str(
            "state_root: /srv/gc\nproject_root: /srv/project\nhost_native:\n  env_passthrough: [GH_TOKEN]\n  security:\n    deny_paths: [/srv/secrets]\n",
        )
        .expect("settings")
    }

    fn group(id: &str, trust: TrustLevel) -> GroupRecord {
        GroupRecord {
            id: id.to_string(),
            name: id.to_string(),
            folder: GroupFolder::parse(id).expect("folder"),
            trust,
            execution_mode: Some(ExecutionMode::HostNative),
            trigger: String::new(),
            security: None,
            added_at: 0,
        }
    }

    fn host_env() -> BTreeMap<String, String> {
        [
            ("PATH", "/usr/bin:/bin"),
            ("HOME", "/home/alice"),
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("AWS_SECRET_ACCESS_KEY", "leak"),
            ("GH_TOKEN", "ghp"),
            ("DATABASE_URL", "postgres://"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn request(group: &GroupRecord, settings: &Settings) -> ExecutionRequest {
        ExecutionRequest {
            run_id: "run-1-abcd".to_string(),
            prompt: "hi".to_string(),
            session_id: None,
            group_folder: group.folder.to_string(),
            chat_id: group.id.clone(),
            is_main: group.is_main(),
            is_scheduled_task: false,
            security: resolve_security_profile(group, ExecutionMode::HostNative, settings),
            integration_servers: BTreeMap::new(),
        }
    }

    #[test]
    fn env_is_allowlisted_and_namespace_paths_are_injected() {
        let settings = settings();
        let runner = HostNativeRunner::new(&settings, StatePaths::new("/srv/gc"), host_env());
        let team = group("team", TrustLevel::Standard);
        let env = runner.worker_env(&team, &request(&team, &settings));

        assert_eq!(env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(env.get("GH_TOKEN").map(String::as_str), Some("ghp"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!env.contains_key("DATABASE_URL"));
        assert_eq!(
            env.get(ENV_GROUP_DIR).map(String::as_str),
            Some("/srv/gc/groups/team")
        );
        assert_eq!(env.get(ENV_IPC_DIR).map(String::as_str), Some("/srv/gc/ipc/team"));
        assert_eq!(env.get(ENV_MODE).map(String::as_str), Some("host"));
        assert!(!env.contains_key(ENV_PROJECT_DIR));

        let main = group("main", TrustLevel::Main);
        let env = runner.worker_env(&main, &request(&main, &settings));
        assert_eq!(env.get(ENV_PROJECT_DIR).map(String::as_str), Some("/srv/project"));
    }

    #[test]
    fn sandbox_spec_denies_secrets_and_scopes_writes_to_own_namespace() {
        let settings = settings();
        let runner = HostNativeRunner::new(&settings, StatePaths::new("/srv/gc"), host_env());
        let spec = runner.sandbox_spec(&group("team", TrustLevel::Standard));
        assert!(spec.deny_paths.contains(&PathBuf::from("/home/alice/.ssh")));
        assert!(spec.deny_paths.contains(&PathBuf::from("/srv/secrets")));
        assert!(spec.read_only_roots.contains(&PathBuf::from("/srv/gc")));
        assert!(spec.writable.contains(&PathBuf::from("/srv/gc/groups/team")));
        assert!(!spec
            .writable
            .iter()
            .any(|path| path.ends_with("groups/main")));
    }

    #[test]
    fn availability_requires_the_worker_program() {
        let mut settings = settings();
        settings.host_native.worker_command = vec!["definitely-not-installed-agent".to_string()];
        let runner = HostNativeRunner::new(&settings, StatePaths::new("/srv/gc"), host_env());
        assert!(matches!(
            runner.check_available(),
            Err(RunnerError::Unavailable { .. })
        ));

        settings.host_native.worker_command = vec!["sh".to_string()];
        let runner = HostNativeRunner::new(&settings, StatePaths::new("/srv/gc"), host_env());
        assert!(runner.check_available().is_ok());
    }
}
