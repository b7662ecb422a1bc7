use super::StatePaths;
use crate::shared::logging::append_event;

/// Appends one event to `logs/runtime.log`.
pub fn append_runtime_log(paths: &StatePaths, level: &str, event: &str, message: &str) {
    append_event(&paths.runtime_log_path(), level, event, message);
}
