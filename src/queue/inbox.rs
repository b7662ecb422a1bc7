use super::{io_err, parse_err, QueueError, WorkItem};
use crate::runtime::StatePaths;
use crate::shared::fs_atomic::atomic_write_json;
use crate::shared::ids::unique_file_stem;
use crate::shared::time::now_millis;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug)]
pub enum Claim {
    Work(WorkItem),
    /// Unparseable file moved aside to `inbox/errors`.
    Quarantined { path: PathBuf, reason: String },
}

pub fn is_inbox_filename(filename: &str) -> bool {
    let path = Path::new(filename);
    if filename.starts_with('.') {
        return false;
    }
    if path.extension().and_then(|v| v.to_str()) != Some("json") {
        return false;
    }
    path.file_stem()
        .and_then(|v| v.to_str())
        .map(|stem| !stem.trim().is_empty())
        .unwrap_or(false)
}

/// Drops a work item into `inbox/incoming`.
pub fn submit(paths: &StatePaths, item: &WorkItem) -> Result<PathBuf, QueueError> {
    let dir = paths.inbox_incoming_dir();
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    let path = dir.join(format!("{}.json", unique_file_stem(now_millis())));
    atomic_write_json(&path, item).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// Claims the oldest inbox file by renaming it into `processing`. The
/// returned item carries the processing path in `claim_path`.
pub fn claim_next(paths: &StatePaths) -> Result<Option<Claim>, QueueError> {
    let processing_dir = paths.inbox_processing_dir();
    fs::create_dir_all(&processing_dir).map_err(|e| io_err(&processing_dir, e))?;

    for incoming_path in sorted_incoming_paths(&paths.inbox_incoming_dir())? {
        let Some(file_name) = incoming_path.file_name() else {
            continue;
        };
        let processing_path = processing_dir.join(file_name);
        match fs::rename(&incoming_path, &processing_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&incoming_path, err)),
        }

        return match read_work_item(&processing_path) {
            Ok(mut item) => {
                item.claim_path = Some(processing_path);
                Ok(Some(Claim::Work(item)))
            }
            Err(err) => {
                let reason = err.to_string();
                let path = quarantine(paths, &processing_path)?;
                Ok(Some(Claim::Quarantined { path, reason }))
            }
        };
    }
    Ok(None)
}

/// Unreadable, non-UTF-8 and unparseable files are all malformed.
fn read_work_item(path: &Path) -> Result<WorkItem, QueueError> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    let raw = String::from_utf8(bytes).map_err(|e| {
        io_err(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.utf8_error()),
        )
    })?;
    serde_json::from_str(&raw).map_err(|e| parse_err(path, e))
}

/// Removes the processing file once its item has been delivered.
pub fn complete(claim_path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(claim_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(claim_path, err)),
    }
}

/// Moves leftovers from a previous run back to `incoming`.
pub fn recover_processing(paths: &StatePaths) -> Result<Vec<PathBuf>, QueueError> {
    let processing_dir = paths.inbox_processing_dir();
    let incoming_dir = paths.inbox_incoming_dir();
    if !processing_dir.exists() {
        return Ok(Vec::new());
    }
    fs::create_dir_all(&incoming_dir).map_err(|e| io_err(&incoming_dir, e))?;

    let mut recovered = Vec::new();
    for entry in fs::read_dir(&processing_dir).map_err(|e| io_err(&processing_dir, e))? {
        let entry = entry.map_err(|e| io_err(&processing_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = incoming_dir.join(name);
        fs::rename(&path, &target).map_err(|e| io_err(&path, e))?;
        recovered.push(target);
    }
    recovered.sort();
    Ok(recovered)
}

fn quarantine(paths: &StatePaths, processing_path: &Path) -> Result<PathBuf, QueueError> {
    let errors_dir = paths.inbox_errors_dir();
    fs::create_dir_all(&errors_dir).map_err(|e| io_err(&errors_dir, e))?;
    let name = processing_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "inbox.json".to_string());
    let target = errors_dir.join(name);
    fs::rename(processing_path, &target).map_err(|e| io_err(processing_path, e))?;
    Ok(target)
}

fn sorted_incoming_paths(incoming_dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let read = match fs::read_dir(incoming_dir) {
        Ok(read) => read,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(incoming_dir, err)),
    };
    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| io_err(incoming_dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let valid = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(is_inbox_filename)
            .unwrap_or(false);
        if !valid {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }
    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn claims_oldest_first_and_completion_removes_the_file() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        submit(&paths, &WorkItem::message("a", "g1", "first")).expect("submit a");
        std::thread::sleep(std::time::Duration::from_millis(5));
        submit(&paths, &WorkItem::message("b", "g1", "second")).expect("submit b");

        let Some(Claim::Work(first)) = claim_next(&paths).expect("claim") else {
            panic!("expected work");
        };
        assert_eq!(first.id, "a");
        let claim_path = first.claim_path.clone().expect("claim path");
        assert!(claim_path.starts_with(paths.inbox_processing_dir()));

        complete(&claim_path).expect("complete");
        assert!(!claim_path.exists());
        let Some(Claim::Work(second)) = claim_next(&paths).expect("claim") else {
            panic!("expected work");
        };
        assert_eq!(second.id, "b");
        assert!(claim_next(&paths).expect("claim").is_none());
    }

    #[test]
    fn malformed_files_are_quarantined_not_retried() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.inbox_incoming_dir()).expect("mkdir");
        fs::write(paths.inbox_incoming_dir().join("bad.json"), "{nope").expect("write");

        match claim_next(&paths).expect("claim") {
            Some(Claim::Quarantined { path, .. }) => {
                assert!(path.starts_with(paths.inbox_errors_dir()));
                assert!(path.exists());
            }
            other => panic!("unexpected claim: {other:?}"),
        }
        assert!(claim_next(&paths).expect("claim").is_none());
    }

    #[test]
    fn non_utf8_files_are_quarantined_and_later_files_still_claimed() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        fs::create_dir_all(paths.inbox_incoming_dir()).expect("mkdir");
        fs::write(paths.inbox_incoming_dir().join("0001-x.json"), [0xff, 0xfe, b'{'])
            .expect("write");
        std::thread::sleep(std::time::Duration::from_millis(5));
        submit(&paths, &WorkItem::message("a", "g1", "after")).expect("submit");

        match claim_next(&paths).expect("claim") {
            Some(Claim::Quarantined { path, reason }) => {
                assert_eq!(path, paths.inbox_errors_dir().join("0001-x.json"));
                assert!(reason.to_lowercase().contains("utf-8"), "{reason}");
            }
            other => panic!("unexpected claim: {other:?}"),
        }
        assert_eq!(
            fs::read_dir(paths.inbox_processing_dir()).expect("processing").count(),
            0
        );
        let Some(Claim::Work(item)) = claim_next(&paths).expect("claim") else {
            panic!("expected work");
        };
        assert_eq!(item.id, "a");
    }

    #[test]
    fn processing_leftovers_are_recovered_on_startup() {
        let dir = tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        submit(&paths, &WorkItem::message("a", "g1", "first")).expect("submit");
        let Some(Claim::Work(_)) = claim_next(&paths).expect("claim") else {
            panic!("expected work");
        };

        let recovered = recover_processing(&paths).expect("recover");
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].starts_with(paths.inbox_incoming_dir()));
        assert!(matches!(claim_next(&paths).expect("claim"), Some(Claim::Work(_))));
    }
}
