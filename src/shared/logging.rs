use std::fs;
use std::io::Write;
use std::path::Path;

/// Appends one JSON object per line. Logging never fails the caller.
pub fn append_json_line(path: &Path, payload: &serde_json::Value) {
    let Ok(line) = serde_json::to_string(payload) else {
        return;
    };
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}

pub fn append_event(path: &Path, level: &str, event: &str, message: &str) {
    append_json_line(
        path,
        &serde_json::json!({
            "timestamp": super::time::now_rfc3339(),
            "level": level,
            "event": event,
            "message": message,
        }),
    );
}

pub fn append_text(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = file.write_all(text.as_bytes());
}
