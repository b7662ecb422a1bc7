use super::{io_err, IpcError, IpcMessage};
use crate::registry::{GroupRecord, GroupRegistry};
use crate::runtime::StatePaths;
use crate::shared::ids::short_digest;
use crate::shared::logging::append_event;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SCANNED_SUBDIRS: [&str; 2] = ["messages", "tasks"];

/// Who sent a message, as derived from where it was found.
#[derive(Debug, Clone, Copy)]
pub struct IpcContext<'a> {
    pub source: &'a GroupRecord,
    pub main: Option<&'a GroupRecord>,
}

impl IpcContext<'_> {
    pub fn is_main(&self) -> bool {
        self.source.is_main()
    }
}

/// Executes authorized IPC messages.
pub trait IpcHandler: Send + Sync {
    fn handle(&self, ctx: &IpcContext<'_>, message: IpcMessage) -> Result<(), IpcError>;
}

/// Authorization that depends only on the source and the message. Task
/// ownership for pause/resume/cancel is checked by the handler.
pub fn authorize(source: &GroupRecord, message: &IpcMessage) -> Result<(), IpcError> {
    if source.is_main() {
        return Ok(());
    }
    let denied = |action: &str| IpcError::Unauthorized {
        group: source.id.clone(),
        action: action.to_string(),
    };
    match message {
        IpcMessage::SendMessage { chat_id, .. } | IpcMessage::SendImage { chat_id, .. } => {
            if chat_id == &source.id {
                Ok(())
            } else {
                Err(denied(&format!("{} to chat `{chat_id}`", message.kind())))
            }
        }
        IpcMessage::CreateTask { target_group, .. } => match target_group {
            Some(target) if target != &source.id => {
                Err(denied(&format!("create_task for group `{target}`")))
            }
            _ => Ok(()),
        },
        IpcMessage::PauseTask { .. } | IpcMessage::ResumeTask { .. } | IpcMessage::CancelTask { .. } => {
            Ok(())
        }
        IpcMessage::RegisterGroup { .. }
        | IpcMessage::SystemHealth
        | IpcMessage::SandboxViolation { .. } => Err(denied(message.kind())),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcScanReport {
    pub processed: usize,
    pub rejected: usize,
    pub quarantined: usize,
    pub failed: usize,
}

/// Drains `ipc/<folder>/{messages,tasks}` for every group. One bad file or
/// one misbehaving group never stops the rest of the scan.
pub struct IpcWatcher {
    paths: StatePaths,
    registry: GroupRegistry,
    handler: Arc<dyn IpcHandler>,
}

impl IpcWatcher {
    pub fn new(paths: StatePaths, handler: Arc<dyn IpcHandler>) -> Self {
        let registry = GroupRegistry::new(&paths.root);
        Self {
            paths,
            registry,
            handler,
        }
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        append_event(&self.paths.runtime_log_path(), level, event, message);
    }

    pub fn process_ipc_once(&self) -> Result<IpcScanReport, IpcError> {
        let mut report = IpcScanReport::default();
        let root = self.paths.ipc_root();
        if !root.exists() {
            return Ok(report);
        }
        let groups = self.registry.all()?;
        let main = groups.iter().find(|group| group.is_main());

        let mut folders = Vec::new();
        for entry in fs::read_dir(&root).map_err(|e| io_err(&root, e))? {
            let entry = entry.map_err(|e| io_err(&root, e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if path.is_dir() && name != "errors" {
                folders.push(name);
            }
        }
        folders.sort();

        for folder in folders {
            let source = groups.iter().find(|group| group.folder.as_str() == folder);
            for sub in SCANNED_SUBDIRS {
                let dir = root.join(&folder).join(sub);
                let files = match json_files(&dir) {
                    Ok(files) => files,
                    Err(err) => {
                        self.log("warn", "ipc.scan_failed", &err.to_string());
                        continue;
                    }
                };
                for file in files {
                    match source {
                        Some(source) => {
                            let ctx = IpcContext { source, main };
                            self.process_file(&ctx, &folder, &file, &mut report);
                        }
                        None => {
                            self.quarantine(&folder, &file, "folder belongs to no registered group");
                            report.quarantined += 1;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    fn process_file(
        &self,
        ctx: &IpcContext<'_>,
        folder: &str,
        file: &Path,
        report: &mut IpcScanReport,
    ) {
        let raw = match fs::read_to_string(file) {
            Ok(raw) => raw,
            Err(err) => {
                self.quarantine(folder, file, &format!("unreadable: {err}"));
                report.quarantined += 1;
                return;
            }
        };
        let message = match serde_json::from_str::<IpcMessage>(&raw) {
            Ok(message) => message,
            Err(err) => {
                self.quarantine(folder, file, &err.to_string());
                report.quarantined += 1;
                return;
            }
        };

        let kind = message.kind();
        if let Err(err) = authorize(ctx.source, &message) {
            self.log("warn", "ipc.rejected", &err.to_string());
            report.rejected += 1;
        } else {
            match self.handler.handle(ctx, message) {
                Ok(()) => {
                    self.log(
                        "info",
                        "ipc.processed",
                        &format!("group=`{}` type={kind}", ctx.source.id),
                    );
                    report.processed += 1;
                }
                Err(err @ IpcError::Unauthorized { .. }) => {
                    self.log("warn", "ipc.rejected", &err.to_string());
                    report.rejected += 1;
                }
                Err(err) => {
                    self.log(
                        "error",
                        "ipc.handler_failed",
                        &format!("group=`{}` type={kind}: {err}", ctx.source.id),
                    );
                    report.failed += 1;
                }
            }
        }
        if let Err(err) = fs::remove_file(file) {
            self.log(
                "warn",
                "ipc.remove_failed",
                &format!("{}: {err}", file.display()),
            );
        }
    }

    fn quarantine(&self, folder: &str, file: &Path, reason: &str) {
        let errors_dir = self.paths.ipc_errors_dir();
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "message.json".to_string());
        let target = errors_dir.join(quarantine_name(folder, file, &name));
        let moved = fs::create_dir_all(&errors_dir).and_then(|_| fs::rename(file, &target));
        match moved {
            Ok(()) => self.log(
                "warn",
                "ipc.quarantined",
                &format!("{} -> {}: {reason}", file.display(), target.display()),
            ),
            Err(err) => self.log(
                "error",
                "ipc.quarantine_failed",
                &format!("{}: {err} (original problem: {reason})", file.display()),
            ),
        }
    }
}

pub fn quarantine_name(folder: &str, file: &Path, name: &str) -> String {
    format!(
        "{folder}-{}-{name}",
        short_digest(&file.display().to_string())
    )
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, IpcError> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(dir, err)),
    };
    let mut files = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if path.is_file() && is_json && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
