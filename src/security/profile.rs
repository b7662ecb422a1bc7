use crate::config::{ExecutionMode, HostNativeSecurity, IntegrationScope, Settings};
use crate::registry::GroupRecord;
use serde::{Deserialize, Serialize};

/// Tool capability that lets a worker talk back over IPC. Granted to every
/// group regardless of its configured allow-list.
pub const IPC_TOOL: &str = "mcp__groupclaw__*";

pub const DEFAULT_SAFE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Glob",
    "Grep",
    "Bash",
    "WebSearch",
    "WebFetch",
    "TodoWrite",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    BypassAll,
    PromptDefault,
}

/// Resolved once per invocation; fields are read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityProfile {
    sandbox_enabled: bool,
    allowed_tools: Option<Vec<String>>,
    permission_mode: PermissionMode,
    setting_sources: Vec<IntegrationScope>,
}

impl SecurityProfile {
    pub fn sandbox_enabled(&self) -> bool {
        self.sandbox_enabled
    }

    /// `None` means unrestricted, which only the main group ever gets.
    pub fn allowed_tools(&self) -> Option<&[String]> {
        self.allowed_tools.as_deref()
    }

    pub fn permission_mode(&self) -> PermissionMode {
        self.permission_mode
    }

    pub fn setting_sources(&self) -> &[IntegrationScope] {
        &self.setting_sources
    }

    pub fn allows_scope(&self, scope: IntegrationScope) -> bool {
        self.setting_sources.contains(&scope)
    }
}

pub fn resolve_security_profile(
    group: &GroupRecord,
    mode: ExecutionMode,
    settings: &Settings,
) -> SecurityProfile {
    if group.is_main() {
        let setting_sources = match mode {
            ExecutionMode::HostNative => vec![IntegrationScope::Project, IntegrationScope::User],
            ExecutionMode::Isolated => vec![IntegrationScope::Project],
        };
        return SecurityProfile {
            sandbox_enabled: false,
            allowed_tools: None,
            permission_mode: PermissionMode::BypassAll,
            setting_sources,
        };
    }

    let fallback = HostNativeSecurity::default();
    let host_security = settings.host_native.security.as_ref().unwrap_or(&fallback);
    let overrides = group.security.clone().unwrap_or_default();

    let sandbox_enabled = match mode {
        ExecutionMode::Isolated => false,
        ExecutionMode::HostNative => {
            overrides.sandbox.unwrap_or(true) && host_security.sandbox_non_main
        }
    };

    let mut tools: Vec<String> = overrides
        .allowed_tools
        .or_else(|| host_security.allowed_tools.clone())
        .unwrap_or_else(|| DEFAULT_SAFE_TOOLS.iter().map(|t| t.to_string()).collect());
    tools.retain(|tool| !tool.trim().is_empty());
    if !tools.iter().any(|tool| tool == IPC_TOOL) {
        tools.push(IPC_TOOL.to_string());
    }

    SecurityProfile {
        sandbox_enabled,
        allowed_tools: Some(tools),
        permission_mode: PermissionMode::PromptDefault,
        setting_sources: vec![IntegrationScope::Project],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SecurityOverrides, TrustLevel};
    use crate::shared::ids::GroupFolder;

    fn settings(extra: &str) -> Settings {
        serde_yaml::from_str(&format!(
            "state_root: /tmp/gc\nproject_root: /tmp/project\n{extra}"
        ))
        .expect("settings")
    }

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

    #[test]
    fn main_group_is_trusted_in_both_modes() {
        let settings = settings("");
        let main = group("main", TrustLevel::Main);
        for mode in [ExecutionMode::Isolated, ExecutionMode::HostNative] {
            let profile = resolve_security_profile(&main, mode, &settings);
            assert_eq!(profile.permission_mode(), PermissionMode::BypassAll);
            assert!(!profile.sandbox_enabled());
            assert!(profile.allowed_tools().is_none());
        }
        let host = resolve_security_profile(&main, ExecutionMode::HostNative, &settings);
        assert!(host.allows_scope(IntegrationScope::User));
        let isolated = resolve_security_profile(&main, ExecutionMode::Isolated, &settings);
        assert!(!isolated.allows_scope(IntegrationScope::User));
    }

    #[test]
    fn standard_groups_never_bypass_and_always_keep_ipc() {
        let settings = settings("host_native:\n  security:\n    allowed_tools: [Read]\n");
        let mut g1 = group("g1", TrustLevel::Standard);
        for mode in [ExecutionMode::Isolated, ExecutionMode::HostNative] {
            let profile = resolve_security_profile(&g1, mode, &settings);
            assert_eq!(profile.permission_mode(), PermissionMode::PromptDefault);
            assert_eq!(
                profile.allowed_tools().expect("restricted"),
                &["Read".to_string(), IPC_TOOL.to_string()]
            );
            assert_eq!(profile.setting_sources(), &[IntegrationScope::Project]);
        }

        g1.security = Some(SecurityOverrides {
            allowed_tools: Some(vec![]),
            sandbox: None,
        });
        let profile = resolve_security_profile(&g1, ExecutionMode::HostNative, &settings);
        assert_eq!(
            profile.allowed_tools().expect("restricted"),
            &[IPC_TOOL.to_string()]
        );
    }

    #[test]
    fn host_native_sandbox_defaults_on_and_only_explicit_config_disables_it() {
        let g1 = group("g1", TrustLevel::Standard);
        let on = settings("host_native:\n  security: {}\n");
        assert!(resolve_security_profile(&g1, ExecutionMode::HostNative, &on).sandbox_enabled());
        assert!(!resolve_security_profile(&g1, ExecutionMode::Isolated, &on).sandbox_enabled());

        let off = settings("host_native:\n  security:\n    sandbox_non_main: false\n");
        assert!(!resolve_security_profile(&g1, ExecutionMode::HostNative, &off).sandbox_enabled());

        let mut opted_out = group("g2", TrustLevel::Standard);
        opted_out.security = Some(SecurityOverrides {
            allowed_tools: None,
            sandbox: Some(false),
        });
        assert!(
            !resolve_security_profile(&opted_out, ExecutionMode::HostNative, &on).sandbox_enabled()
        );
    }

    #[test]
    fn default_tool_list_is_used_without_configuration() {
        let g1 = group("g1", TrustLevel::Standard);
        let profile = resolve_security_profile(&g1, ExecutionMode::Isolated, &settings(""));
        let tools = profile.allowed_tools().expect("restricted");
        assert_eq!(tools.len(), DEFAULT_SAFE_TOOLS.len() + 1);
        assert!(tools.iter().any(|t| t == "Read"));
    }
}
