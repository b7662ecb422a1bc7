use super::host_native::HostNativeRunner;
use super::isolated::IsolatedRunner;
use super::process::{run_worker, RunContext, WorkerBackend, WorkerProcess, WorkerRun};
use super::{ExecutionRequest, ExecutionResult, RunnerError};
use crate::config::{ExecutionMode, Settings};
use crate::monitor::ViolationMonitor;
use crate::queue::{WorkItem, WorkRunner};
use crate::registry::{GroupRecord, GroupRegistry, SessionStore};
use crate::runtime::StatePaths;
use crate::security::{resolve_integration_servers, resolve_security_profile, SecurityProfile};
use crate::shared::ids::generate_run_id;
use crate::shared::logging::append_event;
use crate::shared::time::now_secs;
use std::sync::Arc;

/// Error fragments a worker reports when it cannot pick up a continuation
/// token, typically one minted by the other backend.
const RESUME_FAILURE_PATTERNS: &[&str] = &[
    "no conversation found",
    "session not found",
    "invalid session",
    "failed to resume",
    "could not resume",
];

/// The group's override if it has one, else the global default. Called per
/// invocation so a re-registration applies to the next work item.
pub fn resolve_mode(group: &GroupRecord, settings: &Settings) -> ExecutionMode {
    group.execution_mode.unwrap_or(settings.default_mode)
}

/// What the coordinator gets back for one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The worker ran. Its result may still be an error, which is retryable.
    Completed(ExecutionResult),
    /// The resolved backend is down. Not retried; the user gets `message`.
    Unavailable { mode: ExecutionMode, message: String },
    /// The invocation must not run at all.
    Rejected { reason: String },
}

pub fn is_resume_failure(run: &WorkerRun) -> bool {
    if run.result.is_success() {
        return false;
    }
    let error = run.result.error.as_deref().unwrap_or_default().to_ascii_lowercase();
    let stderr = run.stderr.to_ascii_lowercase();
    RESUME_FAILURE_PATTERNS
        .iter()
        .any(|pattern| error.contains(pattern) || stderr.contains(pattern))
}

fn unavailable_message(mode: ExecutionMode, reason: &str) -> String {
    format!(
        "This group runs in {mode} mode and that backend is unavailable right now, so your request could not be handled. Please try again later. ({reason})"
    )
}

pub struct Dispatcher {
    settings: Arc<Settings>,
    paths: StatePaths,
    registry: GroupRegistry,
    sessions: SessionStore,
    isolated: Arc<dyn WorkerBackend>,
    host_native: Arc<dyn WorkerBackend>,
    monitor: ViolationMonitor,
}

impl Dispatcher {
    pub fn new(
        settings: Arc<Settings>,
        paths: StatePaths,
        isolated: Arc<dyn WorkerBackend>,
        host_native: Arc<dyn WorkerBackend>,
    ) -> Self {
        Self {
            registry: GroupRegistry::new(&paths.root),
            sessions: SessionStore::new(&paths.root),
            monitor: ViolationMonitor::new(paths.clone()).with_deny_paths(
                settings
                    .host_native
                    .security
                    .as_ref()
                    .map(|security| security.deny_paths.as_slice())
                    .unwrap_or_default(),
            ),
            settings,
            paths,
            isolated,
            host_native,
        }
    }

    pub fn with_default_backends(settings: Arc<Settings>) -> Self {
        let paths = StatePaths::new(&settings.state_root);
        let isolated = Arc::new(IsolatedRunner::new(&settings, paths.clone()));
        let host_native = Arc::new(HostNativeRunner::from_process_env(&settings, paths.clone()));
        Self::new(settings, paths, isolated, host_native)
    }

    pub fn backend(&self, mode: ExecutionMode) -> &Arc<dyn WorkerBackend> {
        match mode {
            ExecutionMode::Isolated => &self.isolated,
            ExecutionMode::HostNative => &self.host_native,
        }
    }

    /// Runs `request` on the backend for `mode`. Both backends return the
    /// same `WorkerRun` shape.
    pub fn dispatch(
        &self,
        mode: ExecutionMode,
        group: &GroupRecord,
        request: &ExecutionRequest,
        on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> Result<WorkerRun, RunnerError> {
        let backend = self.backend(mode);
        backend.check_available()?;
        let ctx = RunContext {
            timeout: self.settings.timeouts.worker_timeout(),
            stop_grace: self.settings.timeouts.stop_grace(),
            run_log: self
                .paths
                .run_log_path(group.folder.as_str(), &request.run_id),
        };
        run_worker(backend.as_ref(), group, request, &ctx, on_spawn)
    }

    fn build_request(
        &self,
        group: &GroupRecord,
        item: &WorkItem,
        profile: &SecurityProfile,
        mode: ExecutionMode,
        session_id: Option<String>,
    ) -> ExecutionRequest {
        ExecutionRequest {
            run_id: generate_run_id(now_secs()),
            prompt: item.prompt.clone(),
            session_id,
            group_folder: group.folder.to_string(),
            chat_id: group.id.clone(),
            is_main: group.is_main(),
            is_scheduled_task: item.is_task(),
            security: profile.clone(),
            integration_servers: resolve_integration_servers(&self.settings, profile, mode),
        }
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        append_event(&self.paths.runtime_log_path(), level, event, message);
    }

    /// Dispatches and runs the post-run checks. `Err` only for backend
    /// unavailability; every other failure becomes an error result.
    fn run_once(
        &self,
        mode: ExecutionMode,
        group: &GroupRecord,
        profile: &SecurityProfile,
        request: &ExecutionRequest,
        on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> Result<WorkerRun, DispatchOutcome> {
        let run = match self.dispatch(mode, group, request, on_spawn) {
            Ok(run) => run,
            Err(RunnerError::Unavailable { mode, reason }) => {
                self.log(
                    "warn",
                    "dispatch.unavailable",
                    &format!("group=`{}` mode={mode}: {reason}", group.id),
                );
                return Err(DispatchOutcome::Unavailable {
                    mode,
                    message: unavailable_message(mode, &reason),
                });
            }
            Err(err) => {
                self.log(
                    "error",
                    "dispatch.failed",
                    &format!("group=`{}` run={}: {err}", group.id, request.run_id),
                );
                return Err(DispatchOutcome::Completed(ExecutionResult::error(
                    err.to_string(),
                )));
            }
        };

        if let Err(err) = self.monitor.inspect(
            group,
            profile,
            &request.run_id,
            mode,
            &run.combined_output(),
        ) {
            self.log(
                "error",
                "sandbox.monitor_failed",
                &format!("group=`{}` run={}: {err}", group.id, request.run_id),
            );
        }
        Ok(run)
    }

    pub fn run_work(
        &self,
        group_id: &str,
        item: &WorkItem,
        on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> DispatchOutcome {
        let group = match self.registry.get(group_id) {
            Ok(Some(group)) => group,
            Ok(None) => {
                return DispatchOutcome::Rejected {
                    reason: format!("group `{group_id}` is not registered"),
                }
            }
            Err(err) => {
                return DispatchOutcome::Completed(ExecutionResult::error(format!(
                    "failed to read group registry: {err}"
                )))
            }
        };

        let mode = resolve_mode(&group, &self.settings);
        if mode == ExecutionMode::HostNative && self.settings.host_native.security.is_none() {
            return DispatchOutcome::Rejected {
                reason: format!(
                    "group `{}` resolves to host_native but `host_native.security` is not configured",
                    group.id
                ),
            };
        }

        let profile = resolve_security_profile(&group, mode, &self.settings);
        let token = match self.sessions.portable_token(&group.id, mode) {
            Ok(token) => token,
            Err(err) => {
                self.log(
                    "warn",
                    "session.read_failed",
                    &format!("group=`{}`: {err}; starting fresh", group.id),
                );
                None
            }
        };
        let request = self.build_request(&group, item, &profile, mode, token);

        if let Err(err) = self.paths.ensure_group_namespace(group.folder.as_str()) {
            return DispatchOutcome::Completed(ExecutionResult::error(err.to_string()));
        }
        self.log(
            "info",
            "dispatch.start",
            &format!(
                "group=`{}` item={} mode={mode} run={} resume={}",
                group.id,
                item.id,
                request.run_id,
                request.session_id.is_some()
            ),
        );

        let mut run = match self.run_once(mode, &group, &profile, &request, on_spawn) {
            Ok(run) => run,
            Err(outcome) => return outcome,
        };

        if request.session_id.is_some() && is_resume_failure(&run) {
            self.log(
                "warn",
                "session.fallback",
                &format!(
                    "group=`{}` run={}: continuation token rejected; retrying with a fresh session",
                    group.id, request.run_id
                ),
            );
            if let Err(err) = self.sessions.clear(&group.id) {
                self.log("warn", "session.clear_failed", &format!("group=`{}`: {err}", group.id));
            }
            let fresh = ExecutionRequest {
                run_id: generate_run_id(now_secs()),
                ..request.without_session()
            };
            run = match self.run_once(mode, &group, &profile, &fresh, on_spawn) {
                Ok(run) => run,
                Err(outcome) => return outcome,
            };
        }

        if run.result.is_success() {
            if let Some(token) = run.result.new_session_id.as_deref() {
                if let Err(err) = self.sessions.record(&group.id, token, mode) {
                    self.log("warn", "session.record_failed", &format!("group=`{}`: {err}", group.id));
                }
            }
        }
        DispatchOutcome::Completed(run.result)
    }
}

impl WorkRunner for Dispatcher {
    fn run(
        &self,
        group_id: &str,
        item: &WorkItem,
        on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
    ) -> DispatchOutcome {
        self.run_work(group_id, item, on_spawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TrustLevel;
    use crate::shared::ids::GroupFolder;
    use std::time::Duration;

    fn settings(extra: &str) -> Settings {
        serde_yaml::from_str(&format!(
            "state_root: /tmp/gc\nproject_root: /tmp/project\n{extra}"
        ))
        .expect("settings")
    }

    fn group(id: &str, mode: Option<ExecutionMode>) -> GroupRecord {
        GroupRecord {
            id: id.to_string(),
            name: id.to_string(),
            folder: GroupFolder::parse(id).expect("folder"),
            trust: TrustLevel::Standard,
            execution_mode: mode,
            trigger: String::new(),
            security: None,
            added_at: 0,
        }
    }

    fn failed_run(error: &str, stderr: &str) -> WorkerRun {
        WorkerRun {
            result: ExecutionResult::error(error),
            exit_code: Some(1),
            timed_out: false,
            stdout_truncated: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn override_wins_over_global_default() {
        let isolated_default = settings("");
        assert_eq!(
            resolve_mode(&group("g1", None), &isolated_default),
            ExecutionMode::Isolated
        );
        assert_eq!(
            resolve_mode(&group("g2", Some(ExecutionMode::HostNative)), &isolated_default),
            ExecutionMode::HostNative
        );

        let host_default = settings("default_mode: host_native\n");
        assert_eq!(
            resolve_mode(&group("g1", None), &host_default),
            ExecutionMode::HostNative
        );
        assert_eq!(
            resolve_mode(&group("g3", Some(ExecutionMode::Isolated)), &host_default),
            ExecutionMode::Isolated
        );
    }

    #[test]
    fn resume_failures_are_recognized_in_error_or_stderr() {
        assert!(is_resume_failure(&failed_run(
            "worker exited with code 1: No conversation found with session ID abc",
            ""
        )));
        assert!(is_resume_failure(&failed_run("exit 1", "Error: Failed to resume session")));
        assert!(!is_resume_failure(&failed_run("rate limited", "retry later")));

        let mut ok = failed_run("", "session not found");
        ok.result = ExecutionResult::success_message("fine");
        assert!(!is_resume_failure(&ok));
    }
}
