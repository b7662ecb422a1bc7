use super::{io_err, IpcError, IpcMessage};
use crate::registry::GroupRecord;
use crate::runtime::StatePaths;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::unique_file_stem;
use crate::shared::logging::append_event;
use crate::shared::time::now_millis;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Resolves `.` and `..` without touching the filesystem. `..` never climbs
/// above the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Canonical form of the deepest existing ancestor, with the missing tail
/// re-appended. Symlinks anywhere in the existing part are resolved.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf, IpcError> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
            break;
        };
        missing.push(name);
        if !existing.pop() {
            break;
        }
    }
    let mut resolved = fs::canonicalize(&existing).map_err(|e| io_err(&existing, e))?;
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Worker-facing writer for IPC files. Every write is checked against the
/// source group's namespace before anything touches disk.
#[derive(Debug, Clone)]
pub struct IpcChannel {
    paths: StatePaths,
}

impl IpcChannel {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    /// Main may write anywhere under the IPC root; every other group only
    /// under its own folder.
    pub fn namespace_for(&self, group: &GroupRecord) -> PathBuf {
        if group.is_main() {
            self.paths.ipc_root()
        } else {
            self.paths.ipc_namespace(group.folder.as_str())
        }
    }

    /// Resolves `target_dir` (relative paths are taken from the group's own
    /// folder) and proves it stays inside the namespace, lexically and after
    /// following symlinks.
    pub fn authorize_target(
        &self,
        source: &GroupRecord,
        target_dir: &Path,
    ) -> Result<PathBuf, IpcError> {
        let namespace = normalize_lexically(&self.namespace_for(source));
        let own_folder = self.paths.ipc_namespace(source.folder.as_str());
        let requested = if target_dir.is_absolute() {
            target_dir.to_path_buf()
        } else {
            own_folder.join(target_dir)
        };
        let normalized = normalize_lexically(&requested);
        let reject = || IpcError::OutsideNamespace {
            group: source.id.clone(),
            path: target_dir.display().to_string(),
        };
        if !normalized.starts_with(&namespace) {
            return Err(reject());
        }

        fs::create_dir_all(&namespace).map_err(|e| io_err(&namespace, e))?;
        let canonical_namespace =
            fs::canonicalize(&namespace).map_err(|e| io_err(&namespace, e))?;
        let canonical_target = canonicalize_existing_prefix(&normalized)?;
        if !canonical_target.starts_with(&canonical_namespace) {
            return Err(reject());
        }
        Ok(normalized)
    }

    /// Writes `message` as a new JSON file in `target_dir`, atomically.
    /// Rejected writes are logged and never reach disk.
    pub fn write(
        &self,
        source: &GroupRecord,
        target_dir: &Path,
        message: &IpcMessage,
    ) -> Result<PathBuf, IpcError> {
        let dir = match self.authorize_target(source, target_dir) {
            Ok(dir) => dir,
            Err(err) => {
                append_event(
                    &self.paths.runtime_log_path(),
                    "warn",
                    "ipc.rejected",
                    &format!("group=`{}` type={}: {err}", source.id, message.kind()),
                );
                return Err(err);
            }
        };
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        // A symlink could have been swapped in between the check and mkdir.
        let canonical_dir = fs::canonicalize(&dir).map_err(|e| io_err(&dir, e))?;
        let namespace = self.namespace_for(source);
        let canonical_namespace =
            fs::canonicalize(&namespace).map_err(|e| io_err(&namespace, e))?;
        if !canonical_dir.starts_with(&canonical_namespace) {
            let err = IpcError::OutsideNamespace {
                group: source.id.clone(),
                path: target_dir.display().to_string(),
            };
            append_event(
                &self.paths.runtime_log_path(),
                "warn",
                "ipc.rejected",
                &format!("group=`{}` type={}: {err}", source.id, message.kind()),
            );
            return Err(err);
        }

        let path = canonical_dir.join(format!("{}.json", unique_file_stem(now_millis())));
        atomic_write_json(&path, message).map_err(|e| io_err(&path, e))?;
        Ok(path)
    }

    /// Writes into the conventional subdirectory of `target`'s namespace.
    pub fn send_to(
        &self,
        source: &GroupRecord,
        target: &GroupRecord,
        message: &IpcMessage,
    ) -> Result<PathBuf, IpcError> {
        let dir = self
            .paths
            .ipc_namespace(target.folder.as_str())
            .join(message.subdirectory());
        self.write(source, &dir, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TrustLevel;
    use crate::shared::ids::GroupFolder;
    use tempfile::tempdir;

    fn group(id: &str, trust: TrustLevel) -> GroupRecord {
        GroupRecord {
            id: id.to_string(),
            name: id.to_string(),
            folder: GroupFolder::parse(id).expect("folder"),
            trust,
            execution_mode: None,
            trigger: String::new(),
            security: None,
            added_at: 0,
        }
    }

    fn hello() -> IpcMessage {
        IpcMessage::SendMessage {
            chat_id: "g1".to_string(),
            text: "hello".to_string(),
        }
    }

    #[test]
    fn lexical_normalization_collapses_traversal() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexically(Path::new("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn own_namespace_writes_succeed_and_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let channel = IpcChannel::new(paths.clone());
        let g1 = group("g1", TrustLevel::Standard);

        let written = channel
            .write(&g1, Path::new("messages"), &hello())
            .expect("write");
        let canonical_messages =
            fs::canonicalize(paths.ipc_messages_dir("g1")).expect("canonical");
        assert!(written.starts_with(&canonical_messages));
        let names: Vec<String> = fs::read_dir(&canonical_messages)
            .expect("read")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
    }

    #[test]
    fn traversal_and_absolute_escapes_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let channel = IpcChannel::new(paths.clone());
        let g1 = group("g1", TrustLevel::Standard);

        for target in [
            PathBuf::from("../g2/messages"),
            PathBuf::from("messages/../../g2/messages"),
            paths.ipc_messages_dir("g2"),
            PathBuf::from("/tmp"),
            paths.ipc_root(),
        ] {
            let err = channel.write(&g1, &target, &hello()).expect_err("escape");
            assert!(
                matches!(err, IpcError::OutsideNamespace { .. }),
                "{target:?} gave {err:?}"
            );
        }
        assert!(!paths.ipc_namespace("g2").exists());
        let log = fs::read_to_string(paths.runtime_log_path()).expect("log");
        assert!(log.contains("ipc.rejected"));
    }

    #[test]
    fn symlink_escapes_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let channel = IpcChannel::new(paths.clone());
        let g1 = group("g1", TrustLevel::Standard);

        fs::create_dir_all(paths.ipc_namespace("g1")).expect("mkdir g1");
        fs::create_dir_all(paths.ipc_messages_dir("g2")).expect("mkdir g2");
        std::os::unix::fs::symlink(
            paths.ipc_namespace("g2"),
            paths.ipc_namespace("g1").join("sneaky"),
        )
        .expect("symlink");

        let err = channel
            .write(&g1, Path::new("sneaky/messages"), &hello())
            .expect_err("symlink escape");
        assert!(matches!(err, IpcError::OutsideNamespace { .. }));
        assert_eq!(
            fs::read_dir(paths.ipc_messages_dir("g2"))
                .expect("read")
                .count(),
            0
        );
    }

    #[test]
    fn main_may_write_into_any_group_namespace() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let channel = IpcChannel::new(paths.clone());
        let main = group("main", TrustLevel::Main);
        let g2 = group("g2", TrustLevel::Standard);

        let written = channel.send_to(&main, &g2, &hello()).expect("write");
        assert!(written.starts_with(fs::canonicalize(paths.ipc_namespace("g2")).expect("canon")));
    }
}
