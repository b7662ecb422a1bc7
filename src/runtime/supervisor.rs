use super::{
    append_runtime_log, bootstrap_state_root, RuntimeError, RuntimeIpcHandler, StatePaths,
};
use crate::config::{ConfigError, Settings};
use crate::ipc::{BackendHealth, IpcWatcher};
use crate::queue::{
    claim_next, recover_processing, Claim, Coordinator, CoordinatorConfig, OutboxDelivery,
    RetryPolicy, ShutdownReport,
};
use crate::registry::{GroupRecord, GroupRegistry, TrustLevel};
use crate::runner::{
    validate_startup, BackendProbe, Dispatcher, HostNativeRunner, IsolatedRunner, StartupReport,
    WorkerBackend,
};
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::GroupFolder;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LOOP_PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// Last known runtime status, rewritten on start and stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    #[serde(default)]
    pub backends: Vec<BackendHealth>,
    #[serde(default)]
    pub degraded_groups: Vec<String>,
    pub last_error: Option<String>,
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    atomic_write_json(&path, state).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Installs the configured main group when the registry has none yet.
fn seed_main_group(settings: &Settings, registry: &GroupRegistry, paths: &StatePaths) -> Result<(), RuntimeError> {
    let Some(main) = settings.main_group.as_ref() else {
        return Ok(());
    };
    if let Some(existing) = registry.main_group()? {
        if existing.id != main.id {
            append_runtime_log(
                paths,
                "warn",
                "registry.main_mismatch",
                &format!(
                    "configured main group `{}` ignored; `{}` is already main",
                    main.id, existing.id
                ),
            );
        }
        return Ok(());
    }
    let folder = GroupFolder::parse(&main.folder)
        .map_err(|err| ConfigError::Settings(format!("`main_group.folder`: {err}")))?;
    registry.bootstrap_main(GroupRecord {
        id: main.id.clone(),
        name: main.name.clone().unwrap_or_else(|| main.id.clone()),
        folder,
        trust: TrustLevel::Main,
        execution_mode: main.execution_mode,
        trigger: String::new(),
        security: None,
        added_at: now_secs(),
    })?;
    append_runtime_log(
        paths,
        "info",
        "registry.main_seeded",
        &format!("main group `{}` registered from settings", main.id),
    );
    Ok(())
}

/// Starts with the real container and host-process backends.
pub fn bootstrap(settings: Settings) -> Result<Runtime, RuntimeError> {
    let paths = StatePaths::new(&settings.state_root);
    let isolated: Arc<dyn WorkerBackend> = Arc::new(IsolatedRunner::new(&settings, paths.clone()));
    let host_native: Arc<dyn WorkerBackend> =
        Arc::new(HostNativeRunner::from_process_env(&settings, paths.clone()));
    bootstrap_with_backends(settings, isolated, host_native)
}

/// Prepares the state tree, applies the startup gate and probes backends.
/// Nothing is claimed from the inbox until `Runtime::run`.
pub fn bootstrap_with_backends(
    settings: Settings,
    isolated: Arc<dyn WorkerBackend>,
    host_native: Arc<dyn WorkerBackend>,
) -> Result<Runtime, RuntimeError> {
    settings.validate()?;
    let settings = Arc::new(settings);
    let paths = StatePaths::new(&settings.state_root);
    bootstrap_state_root(&paths)?;

    let registry = GroupRegistry::new(&paths.root);
    seed_main_group(&settings, &registry, &paths)?;
    let groups = registry.all()?;

    if let Err(err) = validate_startup(&settings, &groups) {
        append_runtime_log(&paths, "error", "startup.refused", &err.to_string());
        return Err(err.into());
    }

    let startup = BackendProbe::new(isolated.as_ref(), host_native.as_ref()).probe(&settings, &groups);
    if startup.all_unavailable() {
        let details = startup
            .backends
            .iter()
            .map(|backend| {
                format!(
                    "{}: {}",
                    backend.mode,
                    backend.detail.as_deref().unwrap_or("unavailable")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        append_runtime_log(&paths, "error", "startup.no_backend", &details);
        return Err(RuntimeError::NoBackendAvailable { details });
    }
    if startup.is_degraded() {
        append_runtime_log(
            &paths,
            "warn",
            "startup.degraded",
            &format!(
                "affected groups: [{}]",
                startup.affected_groups.join(", ")
            ),
        );
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&settings),
        paths.clone(),
        Arc::clone(&isolated),
        Arc::clone(&host_native),
    ));
    let coordinator = Coordinator::new(
        dispatcher,
        Arc::new(OutboxDelivery::new(paths.clone())),
        CoordinatorConfig {
            max_concurrency: settings.max_concurrency,
            retry: RetryPolicy::from_settings(&settings.retry),
            log_path: paths.runtime_log_path(),
        },
    );
    let handler = RuntimeIpcHandler::new(Arc::clone(&settings), paths.clone(), isolated, host_native);
    let watcher = IpcWatcher::new(paths.clone(), Arc::new(handler));

    Ok(Runtime {
        settings,
        paths,
        coordinator,
        watcher,
        startup,
        last_ipc_scan: None,
    })
}

pub struct Runtime {
    settings: Arc<Settings>,
    paths: StatePaths,
    coordinator: Coordinator,
    watcher: IpcWatcher,
    startup: StartupReport,
    last_ipc_scan: Option<Instant>,
}

impl Runtime {
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Claims everything waiting in the inbox and admits it.
    pub fn admit_inbox(&mut self) -> Result<usize, RuntimeError> {
        let mut admitted = 0;
        while let Some(claim) = claim_next(&self.paths)? {
            match claim {
                Claim::Work(item) => {
                    self.coordinator.admit(item);
                    admitted += 1;
                }
                Claim::Quarantined { path, reason } => append_runtime_log(
                    &self.paths,
                    "warn",
                    "inbox.quarantined",
                    &format!("{}: {reason}", path.display()),
                ),
            }
        }
        Ok(admitted)
    }

    fn scan_ipc_if_due(&mut self) {
        let interval = self.settings.ipc.poll_interval();
        let due = self
            .last_ipc_scan
            .map(|at| at.elapsed() >= interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_ipc_scan = Some(Instant::now());
        if let Err(err) = self.watcher.process_ipc_once() {
            append_runtime_log(&self.paths, "error", "ipc.scan_failed", &err.to_string());
        }
    }

    /// One loop iteration: inbox, IPC when due, then up to `wait` for
    /// worker events.
    pub fn tick(&mut self, wait: Duration) -> Result<(), RuntimeError> {
        if let Err(err) = self.admit_inbox() {
            append_runtime_log(&self.paths, "error", "inbox.claim_failed", &err.to_string());
        }
        self.scan_ipc_if_due();
        self.coordinator.pump(wait);
        Ok(())
    }

    /// Stops live workers with the configured grace and drops queued work.
    pub fn shutdown(&mut self) -> ShutdownReport {
        self.coordinator.shutdown(self.settings.timeouts.stop_grace())
    }

    fn stop_requested(&self, stop: &AtomicBool) -> bool {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        let stop_path = self.paths.stop_signal_path();
        if stop_path.exists() {
            let _ = fs::remove_file(&stop_path);
            append_runtime_log(&self.paths, "info", "runtime.stop.signal", "stop file detected");
            return true;
        }
        false
    }

    /// Serves until `stop` is set or the stop file appears, then stops
    /// every live worker.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<ShutdownReport, RuntimeError> {
        let recovered = recover_processing(&self.paths)?;
        if !recovered.is_empty() {
            append_runtime_log(
                &self.paths,
                "info",
                "inbox.recovered",
                &format!("{} item(s) returned to incoming", recovered.len()),
            );
        }
        let mut state = SupervisorState {
            running: true,
            pid: Some(std::process::id()),
            started_at: Some(now_secs()),
            stopped_at: None,
            backends: self.startup.backends.clone(),
            degraded_groups: self.startup.affected_groups.clone(),
            last_error: None,
        };
        save_supervisor_state(&self.paths, &state)?;
        append_runtime_log(
            &self.paths,
            "info",
            "runtime.started",
            &format!(
                "pid={} max_concurrency={} default_mode={}",
                std::process::id(),
                self.settings.max_concurrency,
                self.settings.default_mode
            ),
        );

        let mut loop_error = None;
        while !self.stop_requested(stop) {
            if let Err(err) = self.tick(LOOP_PUMP_INTERVAL) {
                append_runtime_log(&self.paths, "error", "runtime.tick_failed", &err.to_string());
                loop_error = Some(err);
                break;
            }
        }

        let report = self.shutdown();
        state.running = false;
        state.pid = None;
        state.stopped_at = Some(now_secs());
        state.last_error = loop_error.as_ref().map(ToString::to_string);
        save_supervisor_state(&self.paths, &state)?;
        append_runtime_log(&self.paths, "info", "runtime.stopped", "runtime stopped");
        match loop_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}
