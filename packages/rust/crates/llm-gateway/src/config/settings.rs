//! Environment configuration (§6.4) for `llm-gateway`.
//!
//! Loads and merges:
//! - System defaults: `<PRJ_ROOT>/packages/conf/settings.yaml`
//! - User overrides:  `<PRJ_CONFIG_HOME>/llm-gateway/settings.yaml`
//!
//! Every field is additionally overridable by an `LLM_GATEWAY_*` environment
//! variable, applied after the YAML merge (merge precedence: env > user > system).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

const DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH: &str = "packages/conf/settings.yaml";
const DEFAULT_USER_SETTINGS_RELATIVE_PATH: &str = "llm-gateway/settings.yaml";
const DEFAULT_CONFIG_HOME_RELATIVE_PATH: &str = ".config";
static CONFIG_HOME_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Top-level runtime settings, covering every option in §6.4.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSettings {
    /// Fallback provider when the router yields no candidate.
    #[serde(default = "default_provider")]
    pub default_provider: String,
    /// Fallback model when the router yields no candidate.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Per-provider pacer parameters, keyed by provider name.
    #[serde(default)]
    pub per_provider: HashMap<String, ProviderSettings>,
    /// Coalescer feature flag.
    #[serde(default)]
    pub coalesce: CoalesceSettings,
    /// Stream Hub fan-out feature flag.
    #[serde(default)]
    pub stream_fanout: StreamFanoutSettings,
    /// Thread store sliding window size.
    #[serde(default)]
    pub thread: ThreadSettings,
    /// Memory provider feature flag.
    #[serde(default)]
    pub memory: MemorySettings,
    /// Query rewriter feature flag.
    #[serde(default)]
    pub query_rewriter: QueryRewriterSettings,
    /// Metrics rolling-window size.
    #[serde(default)]
    pub metrics: MetricsSettings,
    /// SSE heartbeat cadence.
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    /// Overall deadline for the first delta/meta event, milliseconds.
    #[serde(default = "default_client_first_token_timeout_ms")]
    pub client_first_token_timeout_ms: u64,
}

fn default_client_first_token_timeout_ms() -> u64 {
    10_000
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            per_provider: HashMap::new(),
            coalesce: CoalesceSettings::default(),
            stream_fanout: StreamFanoutSettings::default(),
            thread: ThreadSettings::default(),
            memory: MemorySettings::default(),
            query_rewriter: QueryRewriterSettings::default(),
            metrics: MetricsSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            client_first_token_timeout_ms: default_client_first_token_timeout_ms(),
        }
    }
}

/// Per-provider pacer parameters and adapter wiring (§4.4, §6.3, §6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// Requests per second, token-bucket refill rate.
    #[serde(default = "default_rps")]
    pub rps: f64,
    /// Maximum in-flight requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Token-bucket burst capacity.
    #[serde(default = "default_burst")]
    pub burst: f64,
    /// OpenAI-compatible chat-completions endpoint for this provider.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding this provider's API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_rps() -> f64 {
    5.0
}
fn default_concurrency() -> usize {
    10
}
fn default_burst() -> f64 {
    5.0
}
fn default_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            rps: default_rps(),
            concurrency: default_concurrency(),
            burst: default_burst(),
            base_url: default_base_url(),
            api_key_env: None,
        }
    }
}

/// `coalesce.enabled` (§6.4). When false, every request bypasses the coalescer.
#[derive(Debug, Clone, Deserialize)]
pub struct CoalesceSettings {
    /// Feature flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CoalesceSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `stream_fanout.enabled` (§6.4). When false, the hub is bypassed (debug only).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamFanoutSettings {
    /// Feature flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for StreamFanoutSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// `thread.window_turns` (§6.4, §4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadSettings {
    /// Sliding window size, default 20 per §6.4 (the Thread Store's own default
    /// capacity bound is 50 per §4.1; this is the context-assembly window).
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,
}

fn default_window_turns() -> usize {
    20
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self { window_turns: default_window_turns() }
    }
}

/// `memory.enabled` (§6.4). Default false — opt-in per §9 Open Question.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemorySettings {
    /// Feature flag.
    #[serde(default)]
    pub enabled: bool,
}

/// `query_rewriter.enabled` (§6.4). Default false — opt-in per §9 Open Question.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRewriterSettings {
    /// Feature flag.
    #[serde(default)]
    pub enabled: bool,
}

/// `metrics.window_size` (§6.4, §4.8).
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    /// Number of recent request records retained.
    #[serde(default = "default_metrics_window_size")]
    pub window_size: usize,
}

fn default_metrics_window_size() -> usize {
    1000
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { window_size: default_metrics_window_size() }
    }
}

/// `heartbeat.interval_ms` (§6.4, §6.2).
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSettings {
    /// Milliseconds of delta silence before a `ping` heartbeat is sent.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { interval_ms: default_heartbeat_interval_ms() }
    }
}

fn project_root() -> PathBuf {
    std::env::var("PRJ_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Set config-home override (used by the CLI's `--conf` flag).
///
/// The path can be absolute, or relative to `PRJ_ROOT`/cwd.
pub fn set_config_home_override(path: impl Into<PathBuf>) {
    let path = path.into();
    if path.as_os_str().is_empty() {
        return;
    }
    if CONFIG_HOME_OVERRIDE.set(path.clone()).is_err()
        && let Some(current) = CONFIG_HOME_OVERRIDE.get()
        && current != &path
    {
        tracing::warn!(
            current = %current.display(),
            ignored = %path.display(),
            "config home override already set; ignoring subsequent value"
        );
    }
}

fn resolve_config_home(project_root: &Path) -> PathBuf {
    if let Some(path) = CONFIG_HOME_OVERRIDE.get() {
        return absolutize(project_root, path.clone());
    }

    let configured = std::env::var("PRJ_CONFIG_HOME")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_HOME_RELATIVE_PATH.to_string());
    absolutize(project_root, PathBuf::from(configured))
}

fn absolutize(project_root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        project_root.join(path)
    }
}

fn runtime_settings_paths() -> (PathBuf, PathBuf) {
    let root = project_root();
    let system = root.join(DEFAULT_SYSTEM_SETTINGS_RELATIVE_PATH);
    let user = resolve_config_home(&root).join(DEFAULT_USER_SETTINGS_RELATIVE_PATH);
    (system, user)
}

fn read_yaml_if_present(path: &Path) -> anyhow::Result<Option<serde_yaml::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_yaml::from_str(&raw)?))
}

fn merge_yaml(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Apply `LLM_GATEWAY_*` environment overrides for the handful of scalar fields that
/// operators most commonly need to tune without touching YAML (§6.4).
fn apply_env_overrides(mut settings: RuntimeSettings) -> RuntimeSettings {
    if let Ok(v) = std::env::var("LLM_GATEWAY_DEFAULT_PROVIDER") {
        settings.default_provider = v;
    }
    if let Ok(v) = std::env::var("LLM_GATEWAY_DEFAULT_MODEL") {
        settings.default_model = v;
    }
    if let Ok(v) = std::env::var("LLM_GATEWAY_COALESCE_ENABLED").and_then(|s| s.parse::<bool>().map_err(|_| std::env::VarError::NotPresent)) {
        settings.coalesce.enabled = v;
    }
    if let Ok(v) = std::env::var("LLM_GATEWAY_STREAM_FANOUT_ENABLED").and_then(|s| s.parse::<bool>().map_err(|_| std::env::VarError::NotPresent)) {
        settings.stream_fanout.enabled = v;
    }
    if let Ok(v) = std::env::var("LLM_GATEWAY_THREAD_WINDOW_TURNS").and_then(|s| s.parse::<usize>().map_err(|_| std::env::VarError::NotPresent)) {
        settings.thread.window_turns = v;
    }
    settings
}

/// Load settings from the default system/user paths, merged and env-overridden.
pub fn load_runtime_settings() -> anyhow::Result<RuntimeSettings> {
    let (system, user) = runtime_settings_paths();
    load_runtime_settings_from_paths(&system, &user)
}

/// Load settings from explicit system/user paths (exposed for tests and custom CLI
/// flags). User settings take precedence over system settings field-by-field.
pub fn load_runtime_settings_from_paths(system: &Path, user: &Path) -> anyhow::Result<RuntimeSettings> {
    let system_value = read_yaml_if_present(system)?;
    let user_value = read_yaml_if_present(user)?;

    let merged = match (system_value, user_value) {
        (Some(base), Some(overlay)) => merge_yaml(base, overlay),
        (Some(base), None) => base,
        (None, Some(overlay)) => overlay,
        (None, None) => return Ok(apply_env_overrides(RuntimeSettings::default())),
    };

    let settings: RuntimeSettings = serde_yaml::from_value(merged)?;
    Ok(apply_env_overrides(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let settings = RuntimeSettings::default();
        assert!(settings.coalesce.enabled);
        assert!(settings.stream_fanout.enabled);
        assert!(!settings.memory.enabled);
        assert!(!settings.query_rewriter.enabled);
        assert_eq!(settings.thread.window_turns, 20);
        assert_eq!(settings.metrics.window_size, 1000);
        assert_eq!(settings.heartbeat.interval_ms, 15_000);
        assert_eq!(settings.client_first_token_timeout_ms, 10_000);
    }

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.yaml");
        let user = dir.path().join("user.yaml");
        let settings = load_runtime_settings_from_paths(&system, &user).unwrap();
        assert_eq!(settings.default_provider, "openai");
    }

    #[test]
    fn user_overrides_take_precedence_over_system() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.yaml");
        let user = dir.path().join("user.yaml");
        std::fs::write(&system, "default_provider: system_provider\ndefault_model: system_model\n").unwrap();
        std::fs::write(&user, "default_provider: user_provider\n").unwrap();
        let settings = load_runtime_settings_from_paths(&system, &user).unwrap();
        assert_eq!(settings.default_provider, "user_provider");
        assert_eq!(settings.default_model, "system_model");
    }

    #[test]
    fn per_provider_settings_parse() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.yaml");
        let user = dir.path().join("user.yaml");
        std::fs::write(&system, "per_provider:\n  openai:\n    rps: 2.0\n    concurrency: 4\n    burst: 2.0\n").unwrap();
        let settings = load_runtime_settings_from_paths(&system, &user).unwrap();
        let provider = settings.per_provider.get("openai").unwrap();
        assert_eq!(provider.concurrency, 4);
    }
}
