pub mod error;
pub mod load;
pub mod mode;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_global_settings, load_settings};
pub use mode::ExecutionMode;
pub use paths::{default_global_config_path, GLOBAL_SETTINGS_FILE_NAME, GLOBAL_STATE_DIR};
pub use settings::{
    HostNativeSecurity, HostNativeSettings, IntegrationScope, IntegrationServer, IpcSettings,
    IsolatedSettings, MainGroupSettings, RetrySettings, SandboxWrapper, Settings,
    TimeoutSettings,
};
