use super::dispatch::resolve_mode;
use super::process::WorkerBackend;
use crate::config::{ConfigError, ExecutionMode, Settings};
use crate::ipc::BackendHealth;
use crate::registry::GroupRecord;

/// Label used for the global default in gate reports.
pub const DEFAULT_MODE_LABEL: &str = "(default)";

/// Refuses to start when anything resolves to host-native execution and no
/// host-native security profile is configured. The global default counts
/// because groups registered later inherit it.
pub fn validate_startup(settings: &Settings, groups: &[GroupRecord]) -> Result<(), ConfigError> {
    if settings.host_native.security.is_some() {
        return Ok(());
    }
    let mut affected = Vec::new();
    if settings.default_mode == ExecutionMode::HostNative {
        affected.push(DEFAULT_MODE_LABEL.to_string());
    }
    affected.extend(
        groups
            .iter()
            .filter(|group| resolve_mode(group, settings) == ExecutionMode::HostNative)
            .map(|group| group.id.clone()),
    );
    if affected.is_empty() {
        return Ok(());
    }
    Err(ConfigError::MissingHostNativeSecurity { groups: affected })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub backends: Vec<BackendHealth>,
    /// Groups whose resolved backend is down.
    pub affected_groups: Vec<String>,
}

impl StartupReport {
    /// Some backend is down but the system keeps serving the rest.
    pub fn is_degraded(&self) -> bool {
        self.backends.iter().any(|backend| !backend.available)
    }

    pub fn all_unavailable(&self) -> bool {
        self.backends.iter().all(|backend| !backend.available)
    }

    pub fn is_available(&self, mode: ExecutionMode) -> bool {
        self.backends
            .iter()
            .any(|backend| backend.mode == mode && backend.available)
    }
}

/// Checks both backends once. Dispatch re-checks per invocation, so this only
/// shapes the startup report.
pub struct BackendProbe<'a> {
    backends: [&'a dyn WorkerBackend; 2],
}

impl<'a> BackendProbe<'a> {
    pub fn new(isolated: &'a dyn WorkerBackend, host_native: &'a dyn WorkerBackend) -> Self {
        Self {
            backends: [isolated, host_native],
        }
    }

    pub fn backend_health(&self) -> Vec<BackendHealth> {
        self.backends
            .iter()
            .map(|backend| match backend.check_available() {
                Ok(()) => BackendHealth {
                    mode: backend.mode(),
                    available: true,
                    detail: None,
                },
                Err(err) => BackendHealth {
                    mode: backend.mode(),
                    available: false,
                    detail: Some(err.to_string()),
                },
            })
            .collect()
    }

    pub fn probe(&self, settings: &Settings, groups: &[GroupRecord]) -> StartupReport {
        let backends = self.backend_health();
        let down = |mode: ExecutionMode| {
            backends
                .iter()
                .any(|backend| backend.mode == mode && !backend.available)
        };
        let affected_groups = groups
            .iter()
            .filter(|group| down(resolve_mode(group, settings)))
            .map(|group| group.id.clone())
            .collect();
        StartupReport {
            backends,
            affected_groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TrustLevel;
    use crate::runner::{ExecutionRequest, RunnerError, SpawnedWorker};
    use crate::shared::ids::GroupFolder;

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

    struct StaticBackend {
        mode: ExecutionMode,
        up: bool,
    }

    impl WorkerBackend for StaticBackend {
        fn mode(&self) -> ExecutionMode {
            self.mode
        }

        fn check_available(&self) -> Result<(), RunnerError> {
            if self.up {
                Ok(())
            } else {
                Err(RunnerError::Unavailable {
                    mode: self.mode,
                    reason: "daemon not running".to_string(),
                })
            }
        }

        fn output_limit(&self) -> Option<usize> {
            None
        }

        fn spawn(
            &self,
            _group: &GroupRecord,
            _request: &ExecutionRequest,
        ) -> Result<SpawnedWorker, RunnerError> {
            Err(RunnerError::Unavailable {
                mode: self.mode,
                reason: "static backend never spawns".to_string(),
            })
        }
    }

    #[test]
    fn isolated_only_setup_needs_no_host_profile() {
        let settings = settings("");
        let groups = vec![group("g1", None), group("g3", Some(ExecutionMode::Isolated))];
        assert!(validate_startup(&settings, &groups).is_ok());
    }

    #[test]
    fn host_override_without_profile_names_the_group() {
        let settings = settings("");
        let groups = vec![group("g1", None), group("g2", Some(ExecutionMode::HostNative))];
        match validate_startup(&settings, &groups) {
            Err(ConfigError::MissingHostNativeSecurity { groups }) => {
                assert_eq!(groups, vec!["g2".to_string()]);
            }
            other => panic!("unexpected gate result: {other:?}"),
        }
    }

    #[test]
    fn host_default_without_profile_is_reported_even_with_no_groups() {
        let settings = settings("default_mode: host_native\n");
        let err = validate_startup(&settings, &[]).expect_err("gate");
        assert!(err.to_string().contains(DEFAULT_MODE_LABEL));

        let configured = settings_with_profile();
        assert!(validate_startup(&configured, &[group("g2", None)]).is_ok());
    }

    fn settings_with_profile() -> Settings {
        settings("default_mode: host_native\nhost_native:\n  security: {}\n")
    }

    #[test]
    fn probe_marks_groups_on_a_down_backend() {
        let settings = settings_with_profile();
        let isolated = StaticBackend {
            mode: ExecutionMode::Isolated,
            up: false,
        };
        let host = StaticBackend {
            mode: ExecutionMode::HostNative,
            up: true,
        };
        let groups = vec![group("g1", Some(ExecutionMode::Isolated)), group("g2", None)];
        let report = BackendProbe::new(&isolated, &host).probe(&settings, &groups);
        assert!(report.is_degraded());
        assert!(!report.all_unavailable());
        assert!(report.is_available(ExecutionMode::HostNative));
        assert_eq!(report.affected_groups, vec!["g1".to_string()]);
    }
}
