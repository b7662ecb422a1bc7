use crate::config::SandboxWrapper;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("path `{0}` cannot be embedded in a sandbox profile")]
    UnsafePath(String),
    #[error("worker command is empty")]
    EmptyCommand,
}

/// Inputs for the host-native OS sandbox.
///
/// The profile is a denylist: everything is allowed except reads and writes
/// under `deny_paths`, writes under `read_only_roots` (minus `writable`), and
/// optionally outbound network traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxSpec {
    pub deny_paths: Vec<PathBuf>,
    pub read_only_roots: Vec<PathBuf>,
    pub writable: Vec<PathBuf>,
    pub deny_network_outbound: bool,
}

pub const SENSITIVE_HOME_ENTRIES: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".kube",
    ".docker",
    ".azure",
    ".config",
    ".netrc",
    ".npmrc",
    ".pypirc",
    ".git-credentials",
    ".bash_history",
    ".zsh_history",
];

/// Credential directories and secret-bearing dotfiles under `home`.
pub fn default_sensitive_paths(home: &Path) -> Vec<PathBuf> {
    SENSITIVE_HOME_ENTRIES
        .iter()
        .map(|entry| home.join(entry))
        .collect()
}

fn escape_sbpl_path(path: &Path) -> Result<String, SandboxError> {
    let raw = path.display().to_string();
    if raw.contains('"') || raw.contains('\\') || raw.contains('\n') || raw.contains('\0') {
        return Err(SandboxError::UnsafePath(raw));
    }
    Ok(raw)
}

/// SBPL profile for `sandbox-exec -p`. Later rules take precedence.
pub fn seatbelt_profile(spec: &SandboxSpec) -> Result<String, SandboxError> {
    let mut profile = String::new();
    profile.push_str("(version 1)\n");
    profile.push_str("(allow default)\n");
    profile.push_str("(deny network-bind)\n");

    if spec.deny_network_outbound {
        profile.push_str("(deny network-outbound (remote ip \"*:*\"))\n");
        profile.push_str("(allow network-outbound (remote ip \"localhost:*\"))\n");
    }

    for root in &spec.read_only_roots {
        let root = escape_sbpl_path(root)?;
        profile.push_str(&format!("(deny file-write* (subpath \"{root}\"))\n"));
    }
    for path in &spec.writable {
        let path = escape_sbpl_path(path)?;
        profile.push_str(&format!(
            "(allow file-read* file-write* (subpath \"{path}\"))\n"
        ));
    }
    for path in &spec.deny_paths {
        let path = escape_sbpl_path(path)?;
        profile.push_str(&format!(
            "(deny file-read* file-write* (subpath \"{path}\"))\n"
        ));
    }

    Ok(profile)
}

/// `bwrap` arguments up to (not including) the wrapped command. Denied
/// directories are masked with an unreadable tmpfs, denied files with
/// `/dev/null`; missing paths are skipped since bwrap cannot mount over them.
pub fn bubblewrap_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args = vec![
        "--die-with-parent".to_string(),
        "--dev-bind".to_string(),
        "/".to_string(),
        "/".to_string(),
    ];
    if spec.deny_network_outbound {
        args.push("--unshare-net".to_string());
    }
    for root in spec.read_only_roots.iter().filter(|p| p.exists()) {
        let root = root.display().to_string();
        args.extend(["--ro-bind".to_string(), root.clone(), root]);
    }
    for path in spec.writable.iter().filter(|p| p.exists()) {
        let path = path.display().to_string();
        args.extend(["--bind".to_string(), path.clone(), path]);
    }
    for path in &spec.deny_paths {
        if path.is_dir() {
            args.extend([
                "--perms".to_string(),
                "0000".to_string(),
                "--tmpfs".to_string(),
                path.display().to_string(),
            ]);
        } else if path.is_file() {
            args.extend([
                "--ro-bind".to_string(),
                "/dev/null".to_string(),
                path.display().to_string(),
            ]);
        }
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedWrapper {
    Seatbelt,
    Bubblewrap,
}

fn resolve_wrapper(wrapper: SandboxWrapper) -> ResolvedWrapper {
    match wrapper {
        SandboxWrapper::Auto if cfg!(target_os = "macos") => ResolvedWrapper::Seatbelt,
        SandboxWrapper::Auto => ResolvedWrapper::Bubblewrap,
        SandboxWrapper::SandboxExec => ResolvedWrapper::Seatbelt,
        SandboxWrapper::Bubblewrap => ResolvedWrapper::Bubblewrap,
    }
}

/// Program and arguments for a host-native worker, wrapped in the OS sandbox
/// when `spec` is present.
pub fn wrap_worker_command(
    worker_command: &[String],
    wrapper: SandboxWrapper,
    wrapper_bin: Option<&str>,
    spec: Option<&SandboxSpec>,
) -> Result<(String, Vec<String>), SandboxError> {
    let (program, rest) = match worker_command.split_first() {
        Some((program, rest)) => (program.clone(), rest.to_vec()),
        None => return Err(SandboxError::EmptyCommand),
    };
    let Some(spec) = spec else {
        return Ok((program, rest));
    };

    let mut args = Vec::new();
    let wrapper_program = match resolve_wrapper(wrapper) {
        ResolvedWrapper::Seatbelt => {
            args.push("-p".to_string());
            args.push(seatbelt_profile(spec)?);
            wrapper_bin.unwrap_or("sandbox-exec").to_string()
        }
        ResolvedWrapper::Bubblewrap => {
            args.extend(bubblewrap_args(spec));
            args.push("--".to_string());
            wrapper_bin.unwrap_or("bwrap").to_string()
        }
    };
    args.push(program);
    args.extend(rest);
    Ok((wrapper_program, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            deny_paths: default_sensitive_paths(Path::new("/Users/alice")),
            read_only_roots: vec![PathBuf::from("/srv/gc")],
            writable: vec![PathBuf::from("/srv/gc/groups/g1")],
            deny_network_outbound: false,
        }
    }

    #[test]
    fn seatbelt_profile_denies_secrets_and_scopes_writes() {
        let profile = seatbelt_profile(&spec()).expect("profile");
        assert!(profile.starts_with("(version 1)\n(allow default)\n"));
        assert!(profile.contains("(deny file-read* file-write* (subpath \"/Users/alice/.ssh\"))"));
        assert!(profile.contains("(deny file-read* file-write* (subpath \"/Users/alice/.config\"))"));
        assert!(profile.contains("(deny file-write* (subpath \"/srv/gc\"))"));
        assert!(profile.contains("(allow file-read* file-write* (subpath \"/srv/gc/groups/g1\"))"));
        assert!(!profile.contains("network-outbound"));

        let deny_pos = profile.find("(deny file-write* (subpath \"/srv/gc\"))").expect("deny");
        let allow_pos = profile.find("/srv/gc/groups/g1").expect("allow");
        assert!(deny_pos < allow_pos, "own namespace must override the root deny");
    }

    #[test]
    fn seatbelt_profile_rejects_quote_injection() {
        let mut spec = spec();
        spec.deny_paths.push(PathBuf::from("/tmp/\")(allow default"));
        assert!(matches!(
            seatbelt_profile(&spec),
            Err(SandboxError::UnsafePath(_))
        ));
    }

    #[test]
    fn bubblewrap_masks_only_existing_paths() {
        let dir = tempdir().expect("tempdir");
        let secret_dir = dir.path().join(".ssh");
        fs::create_dir_all(&secret_dir).expect("mkdir");
        let secret_file = dir.path().join(".netrc");
        fs::write(&secret_file, "machine x").expect("write");

        let args = bubblewrap_args(&SandboxSpec {
            deny_paths: default_sensitive_paths(dir.path()),
            read_only_roots: Vec::new(),
            writable: Vec::new(),
            deny_network_outbound: true,
        });
        let joined = args.join(" ");
        assert!(joined.contains(&format!("--perms 0000 --tmpfs {}", secret_dir.display())));
        assert!(joined.contains(&format!("--ro-bind /dev/null {}", secret_file.display())));
        assert!(joined.contains("--unshare-net"));
        assert!(!joined.contains(".aws"));
    }

    #[test]
    fn wrappers_resolve_to_their_own_program() {
        assert_eq!(resolve_wrapper(SandboxWrapper::Bubblewrap), ResolvedWrapper::Bubblewrap);
        assert_eq!(resolve_wrapper(SandboxWrapper::SandboxExec), ResolvedWrapper::Seatbelt);
        let expected = if cfg!(target_os = "macos") {
            ResolvedWrapper::Seatbelt
        } else {
            ResolvedWrapper::Bubblewrap
        };
        assert_eq!(resolve_wrapper(SandboxWrapper::Auto), expected);
    }

    #[test]
    fn unsandboxed_command_is_passed_through() {
        let command = vec!["node".to_string(), "agent.js".to_string()];
        let (program, args) =
            wrap_worker_command(&command, SandboxWrapper::Auto, None, None).expect("wrap");
        assert_eq!(program, "node");
        assert_eq!(args, vec!["agent.js".to_string()]);
    }

    #[test]
    fn explicit_wrappers_prefix_the_worker() {
        let command = vec!["node".to_string(), "agent.js".to_string()];
        let (program, args) = wrap_worker_command(
            &command,
            SandboxWrapper::SandboxExec,
            None,
            Some(&spec()),
        )
        .expect("wrap");
        assert_eq!(program, "sandbox-exec");
        assert_eq!(args[0], "-p");
        assert_eq!(&args[2..], &["node".to_string(), "agent.js".to_string()]);

        let (program, args) = wrap_worker_command(
            &command,
            SandboxWrapper::Bubblewrap,
            Some("/usr/local/bin/bwrap"),
            Some(&spec()),
        )
        .expect("wrap");
        assert_eq!(program, "/usr/local/bin/bwrap");
        let sep = args.iter().position(|a| a == "--").expect("separator");
        assert_eq!(&args[sep + 1..], &["node".to_string(), "agent.js".to_string()]);
    }
}
