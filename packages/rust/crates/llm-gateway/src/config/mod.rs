//! Config namespace: environment configuration loading (§6.4).

mod settings;

pub use settings::{
    CoalesceSettings, HeartbeatSettings, MemorySettings, MetricsSettings, ProviderSettings,
    QueryRewriterSettings, RuntimeSettings, StreamFanoutSettings, ThreadSettings,
    load_runtime_settings, load_runtime_settings_from_paths, set_config_home_override,
};
