use super::{append_runtime_log, StatePaths};
use crate::config::{ExecutionMode, Settings};
use crate::ipc::{
    build_health_snapshot, normalize_lexically, write_health_snapshot, IpcContext, IpcError,
    IpcHandler, IpcMessage,
};
use crate::queue::{write_outbox_message, OutboxKind, OutboxMessage};
use crate::registry::{
    GroupRecord, GroupRegistry, SecurityOverrides, TaskRecord, TaskStatus, TaskStore, TrustLevel,
};
use crate::runner::isolated::CONTAINER_GROUP_DIR;
use crate::runner::{BackendProbe, WorkerBackend};
use crate::shared::ids::{unique_file_stem, validate_identifier_value, GroupFolder};
use crate::shared::time::{now_millis, now_secs};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Carries out authorized IPC requests against the registry, the task store
/// and the outbox.
pub struct RuntimeIpcHandler {
    settings: Arc<Settings>,
    paths: StatePaths,
    registry: GroupRegistry,
    tasks: TaskStore,
    isolated: Arc<dyn WorkerBackend>,
    host_native: Arc<dyn WorkerBackend>,
}

struct GroupRegistration {
    group_id: String,
    name: String,
    folder: String,
    trigger: String,
    execution_mode: Option<ExecutionMode>,
    security: Option<SecurityOverrides>,
}

impl RuntimeIpcHandler {
    pub fn new(
        settings: Arc<Settings>,
        paths: StatePaths,
        isolated: Arc<dyn WorkerBackend>,
        host_native: Arc<dyn WorkerBackend>,
    ) -> Self {
        Self {
            registry: GroupRegistry::new(&paths.root),
            tasks: TaskStore::new(&paths.root),
            settings,
            paths,
            isolated,
            host_native,
        }
    }

    fn notice(
        &self,
        group_id: &str,
        chat_id: &str,
        text: String,
        attachment: Option<String>,
    ) -> Result<(), IpcError> {
        let message = OutboxMessage {
            group_id: group_id.to_string(),
            chat_id: chat_id.to_string(),
            in_reply_to: format!("ipc-{}", unique_file_stem(now_millis())),
            kind: OutboxKind::Notice,
            text,
            attachment,
            timestamp: now_secs(),
        };
        write_outbox_message(&self.paths, &message)?;
        Ok(())
    }

    /// Maps a worker-visible image path to the host and keeps non-main
    /// groups inside their own workspace.
    fn resolve_attachment(&self, source: &GroupRecord, raw: &str) -> Result<PathBuf, IpcError> {
        let group_dir = self.paths.group_dir(source.folder.as_str());
        let requested = Path::new(raw);
        let host = match requested.strip_prefix(CONTAINER_GROUP_DIR) {
            Ok(rest) => group_dir.join(rest),
            Err(_) if requested.is_absolute() => requested.to_path_buf(),
            Err(_) => group_dir.join(requested),
        };
        let resolved = fs::canonicalize(&host)
            .map_err(|_| IpcError::Invalid(format!("image `{raw}` does not exist")))?;
        if source.is_main() {
            return Ok(resolved);
        }
        let canonical_group = fs::canonicalize(&group_dir).unwrap_or_else(|_| normalize_lexically(&group_dir));
        if !resolved.starts_with(&canonical_group) {
            return Err(IpcError::OutsideNamespace {
                group: source.id.clone(),
                path: raw.to_string(),
            });
        }
        Ok(resolved)
    }

    fn create_task(
        &self,
        ctx: &IpcContext<'_>,
        target_group: Option<String>,
        prompt: String,
        schedule: String,
        task_id: Option<String>,
    ) -> Result<(), IpcError> {
        let group_id = target_group.unwrap_or_else(|| ctx.source.id.clone());
        if self.registry.get(&group_id)?.is_none() {
            return Err(IpcError::Invalid(format!(
                "create_task targets unregistered group `{group_id}`"
            )));
        }
        if prompt.trim().is_empty() || schedule.trim().is_empty() {
            return Err(IpcError::Invalid(
                "create_task needs a prompt and a schedule".to_string(),
            ));
        }
        let id = task_id.unwrap_or_else(|| format!("task-{}", unique_file_stem(now_millis())));
        validate_identifier_value("task id", &id).map_err(IpcError::Invalid)?;
        let now = now_secs();
        self.tasks.create(TaskRecord {
            id: id.clone(),
            group_id: group_id.clone(),
            prompt,
            schedule,
            status: TaskStatus::Active,
            created_by: ctx.source.id.clone(),
            created_at: now,
            updated_at: now,
        })?;
        append_runtime_log(
            &self.paths,
            "info",
            "task.created",
            &format!("task=`{id}` group=`{group_id}` by=`{}`", ctx.source.id),
        );
        Ok(())
    }

    fn set_task_status(
        &self,
        ctx: &IpcContext<'_>,
        task_id: &str,
        status: TaskStatus,
        action: &str,
    ) -> Result<(), IpcError> {
        let task = self.tasks.get(task_id)?.ok_or_else(|| IpcError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if !ctx.is_main() && task.group_id != ctx.source.id {
            return Err(IpcError::Unauthorized {
                group: ctx.source.id.clone(),
                action: format!("{action} task `{task_id}` owned by `{}`", task.group_id),
            });
        }
        self.tasks.set_status(task_id, status)?;
        Ok(())
    }

    fn register_group(&self, ctx: &IpcContext<'_>, request: GroupRegistration) -> Result<(), IpcError> {
        let folder = GroupFolder::parse(&request.folder).map_err(IpcError::Invalid)?;
        if request.execution_mode == Some(ExecutionMode::HostNative)
            && self.settings.host_native.security.is_none()
        {
            return Err(IpcError::Invalid(format!(
                "group `{}` cannot run host_native: `host_native.security` is not configured",
                request.group_id
            )));
        }
        let existing = self.registry.get(&request.group_id)?;
        // Re-registration never changes trust or the original join time.
        let (trust, added_at) = match &existing {
            Some(record) => (record.trust, record.added_at),
            None => (TrustLevel::Standard, now_secs()),
        };
        self.registry.register(
            ctx.source,
            GroupRecord {
                id: request.group_id.clone(),
                name: request.name,
                folder,
                trust,
                execution_mode: request.execution_mode,
                trigger: request.trigger,
                security: request.security,
                added_at,
            },
        )?;
        append_runtime_log(
            &self.paths,
            "info",
            "registry.registered",
            &format!(
                "group=`{}` mode_override={} replaced={}",
                request.group_id,
                request
                    .execution_mode
                    .map(ExecutionMode::as_str)
                    .unwrap_or("none"),
                existing.is_some()
            ),
        );
        Ok(())
    }

    fn write_health(&self, ctx: &IpcContext<'_>) -> Result<(), IpcError> {
        let groups = self.registry.all()?;
        let probe = BackendProbe::new(self.isolated.as_ref(), self.host_native.as_ref());
        let snapshot = build_health_snapshot(&self.settings, &groups, probe.backend_health());
        write_health_snapshot(&self.paths, ctx.source.folder.as_str(), &snapshot)?;
        Ok(())
    }
}

impl IpcHandler for RuntimeIpcHandler {
    fn handle(&self, ctx: &IpcContext<'_>, message: IpcMessage) -> Result<(), IpcError> {
        match message {
            IpcMessage::SendMessage { chat_id, text } => {
                self.notice(&ctx.source.id, &chat_id, text, None)
            }
            IpcMessage::SendImage {
                chat_id,
                path,
                caption,
            } => {
                let attachment = self.resolve_attachment(ctx.source, &path)?;
                self.notice(
                    &ctx.source.id,
                    &chat_id,
                    caption.unwrap_or_default(),
                    Some(attachment.display().to_string()),
                )
            }
            IpcMessage::CreateTask {
                target_group,
                prompt,
                schedule,
                task_id,
            } => self.create_task(ctx, target_group, prompt, schedule, task_id),
            IpcMessage::PauseTask { task_id } => {
                self.set_task_status(ctx, &task_id, TaskStatus::Paused, "pause")
            }
            IpcMessage::ResumeTask { task_id } => {
                self.set_task_status(ctx, &task_id, TaskStatus::Active, "resume")
            }
            IpcMessage::CancelTask { task_id } => {
                self.set_task_status(ctx, &task_id, TaskStatus::Cancelled, "cancel")
            }
            IpcMessage::RegisterGroup {
                group_id,
                name,
                folder,
                trigger,
                execution_mode,
                security,
            } => self.register_group(
                ctx,
                GroupRegistration {
                    group_id,
                    name,
                    folder,
                    trigger,
                    execution_mode,
                    security,
                },
            ),
            IpcMessage::SystemHealth => self.write_health(ctx),
            IpcMessage::SandboxViolation {
                group_id,
                run_id,
                mode,
                denials,
                audit_log,
                ..
            } => {
                let first = denials.first().map(String::as_str).unwrap_or("(none)");
                let text = format!(
                    "Sandbox violation in group `{group_id}` (run {run_id}, {mode} mode): {} denial(s). First: {first}. Audit log: {audit_log}",
                    denials.len()
                );
                self.notice(&ctx.source.id, &ctx.source.id, text, None)
            }
        }
    }
}
