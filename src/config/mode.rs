use serde::{Deserialize, Serialize};

/// Which worker backend runs an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Isolated,
    #[serde(alias = "host-native")]
    HostNative,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Isolated => "isolated",
            Self::HostNative => "host_native",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "isolated" | "container" => Ok(Self::Isolated),
            "host_native" | "host-native" | "host" => Ok(Self::HostNative),
            other => Err(format!(
                "execution mode must be `isolated` or `host_native`, got `{other}`"
            )),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
