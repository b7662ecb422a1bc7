use super::SecurityProfile;
use crate::config::{ExecutionMode, IntegrationServer, Settings};
use std::collections::BTreeMap;

/// Integration servers a worker may load for one invocation: enabled for the
/// active mode and within the scopes the profile grants.
pub fn resolve_integration_servers(
    settings: &Settings,
    profile: &SecurityProfile,
    mode: ExecutionMode,
) -> BTreeMap<String, IntegrationServer> {
    settings
        .integration_servers
        .iter()
        .filter(|(_, server)| server.enabled_for(mode) && profile.allows_scope(server.scope))
        .map(|(name, server)| (name.clone(), server.clone()))
        .collect()
}
