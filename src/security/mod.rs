pub mod integrations;
pub mod profile;
pub mod sandbox;

pub use integrations::resolve_integration_servers;
pub use profile::{
    resolve_security_profile, PermissionMode, SecurityProfile, DEFAULT_SAFE_TOOLS, IPC_TOOL,
};
pub use sandbox::{
    bubblewrap_args, default_sensitive_paths, seatbelt_profile, wrap_worker_command, SandboxError,
    SandboxSpec, SENSITIVE_HOME_ENTRIES,
};
