use crate::config::ExecutionMode;
use crate::ipc::{IpcChannel, IpcError, IpcMessage};
use crate::registry::{GroupRecord, GroupRegistry, RegistryError};
use crate::runtime::StatePaths;
use crate::security::{SecurityProfile, SENSITIVE_HOME_ENTRIES};
use crate::shared::logging::{append_event, append_json_line};
use crate::shared::time::now_rfc3339;
use std::path::PathBuf;

/// Fragments only the seatbelt and bubblewrap wrappers print.
pub const SANDBOX_DENIAL_PATTERNS: &[&str] = &["Sandbox: ", "deny(1)", "sandbox-exec: ", "bwrap: "];

/// Plain EPERM text. Ordinary tools print it too, so it only counts when the
/// same line names a denied path.
pub const EPERM_SIGNATURE: &str = "Operation not permitted";

const MAX_RECORDED_DENIALS: usize = 20;
const MAX_DENIAL_LINE_CHARS: usize = 400;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Paths a sandboxed worker is denied: the sensitive home entries (matched
/// as `/<entry>` anywhere in a line) plus the configured deny paths.
pub fn denied_path_fragments(deny_paths: &[PathBuf]) -> Vec<String> {
    SENSITIVE_HOME_ENTRIES
        .iter()
        .map(|entry| format!("/{entry}"))
        .chain(deny_paths.iter().map(|path| path.display().to_string()))
        .filter(|fragment| !fragment.is_empty())
        .collect()
}

/// True when `fragment` occurs in `line` as a whole path component prefix.
fn mentions_path(line: &str, fragment: &str) -> bool {
    line.match_indices(fragment).any(|(at, _)| {
        matches!(
            line[at + fragment.len()..].chars().next(),
            None | Some('/' | ':' | '\'' | '"' | ' ' | ')')
        )
    })
}

fn is_denial(line: &str, denied: &[String]) -> bool {
    if SANDBOX_DENIAL_PATTERNS
        .iter()
        .any(|pattern| line.contains(pattern))
    {
        return true;
    }
    line.contains(EPERM_SIGNATURE) && denied.iter().any(|fragment| mentions_path(line, fragment))
}

/// Output lines that look like sandbox denials, deduplicated and capped.
/// `denied` comes from [`denied_path_fragments`].
pub fn detect_denials(output: &str, denied: &[String]) -> Vec<String> {
    let mut denials: Vec<String> = Vec::new();
    for line in output.lines() {
        if !is_denial(line, denied) {
            continue;
        }
        let line: String = line.trim().chars().take(MAX_DENIAL_LINE_CHARS).collect();
        if !denials.contains(&line) {
            denials.push(line);
        }
        if denials.len() >= MAX_RECORDED_DENIALS {
            break;
        }
    }
    denials
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationReport {
    pub audit_path: PathBuf,
    pub alert_path: Option<PathBuf>,
    pub denials: Vec<String>,
}

/// Post-run check of sandboxed output. Detection is best effort; the run's
/// own exit status still decides retries.
pub struct ViolationMonitor {
    paths: StatePaths,
    registry: GroupRegistry,
    channel: IpcChannel,
    denied: Vec<String>,
}

impl ViolationMonitor {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            registry: GroupRegistry::new(&paths.root),
            channel: IpcChannel::new(paths.clone()),
            paths,
            denied: denied_path_fragments(&[]),
        }
    }

    /// Adds configured deny paths to the ones EPERM lines are matched against.
    pub fn with_deny_paths(mut self, deny_paths: &[PathBuf]) -> Self {
        self.denied = denied_path_fragments(deny_paths);
        self
    }

    pub fn is_eligible(group: &GroupRecord, profile: &SecurityProfile) -> bool {
        !group.is_main() && profile.sandbox_enabled()
    }

    pub fn inspect(
        &self,
        group: &GroupRecord,
        profile: &SecurityProfile,
        run_id: &str,
        mode: ExecutionMode,
        output: &str,
    ) -> Result<Option<ViolationReport>, MonitorError> {
        if !Self::is_eligible(group, profile) {
            return Ok(None);
        }
        let denials = detect_denials(output, &self.denied);
        if denials.is_empty() {
            return Ok(None);
        }

        let folder = group.folder.as_str();
        let audit_path = self.paths.sandbox_audit_path(folder);
        append_json_line(
            &audit_path,
            &serde_json::json!({
                "timestamp": now_rfc3339(),
                "groupId": group.id,
                "groupFolder": folder,
                "runId": run_id,
                "mode": mode,
                "denials": denials,
            }),
        );

        let alert_path = match self.registry.main_group()? {
            Some(main) => {
                let alert = IpcMessage::SandboxViolation {
                    group_id: group.id.clone(),
                    group_folder: folder.to_string(),
                    run_id: run_id.to_string(),
                    mode,
                    denials: denials.clone(),
                    audit_log: audit_path.display().to_string(),
                };
                Some(self.channel.send_to(&main, &main, &alert)?)
            }
            None => {
                append_event(
                    &self.paths.runtime_log_path(),
                    "warn",
                    "sandbox.alert_skipped",
                    &format!("no main group registered; violation in `{folder}` only audited"),
                );
                None
            }
        };

        append_event(
            &self.paths.runtime_log_path(),
            "warn",
            "sandbox.violation",
            &format!(
                "group=`{}` run={run_id} denials={}",
                group.id,
                denials.len()
            ),
        );
        Ok(Some(ViolationReport {
            audit_path,
            alert_path,
            denials,
        }))
    }
}
