use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use concierge_providers::{CallPolicy, ProviderConfig, ProvidersConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_SECRET_KEY: &str = "your-secret-key-change-in-production";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: `{value}` ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Effective service configuration, built once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub app_version: String,
    pub debug: bool,
    pub host: String,
    pub port: u16,
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    pub secret_key: String,
    pub algorithm: String,
    pub access_token_expire_minutes: i64,
    pub database_url: Option<String>,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u32,
    pub session_timeout: u64,
    pub log_level: String,
    pub log_file: PathBuf,
    pub log_retention_days: u64,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub max_concurrent_model_calls: usize,
    pub cors_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "Enterprise AI Agent".to_string(),
            app_version: "1.0.0".to_string(),
            debug: false,
            host: "127.0.0.1".to_string(),
            port: 8000,
            providers: HashMap::new(),
            default_provider: None,
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            algorithm: "HS256".to_string(),
            access_token_expire_minutes: 30,
            database_url: None,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_db: 0,
            session_timeout: 3600,
            log_level: "info".to_string(),
            log_file: PathBuf::from("logs/agent.log"),
            log_retention_days: 14,
            max_retries: 3,
            timeout_seconds: 30,
            max_concurrent_model_calls: 8,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Clone, Copy)]
enum EnvKind {
    Str,
    Bool,
    Int,
    Csv,
}

/// Environment variable → settings key.
const ENV_KEYS: &[(&str, &str, EnvKind)] = &[
    ("APP_NAME", "app_name", EnvKind::Str),
    ("APP_VERSION", "app_version", EnvKind::Str),
    ("DEBUG", "debug", EnvKind::Bool),
    ("HOST", "host", EnvKind::Str),
    ("PORT", "port", EnvKind::Int),
    ("DEFAULT_PROVIDER", "default_provider", EnvKind::Str),
    ("SECRET_KEY", "secret_key", EnvKind::Str),
    ("ALGORITHM", "algorithm", EnvKind::Str),
    (
        "ACCESS_TOKEN_EXPIRE_MINUTES",
        "access_token_expire_minutes",
        EnvKind::Int,
    ),
    ("DATABASE_URL", "database_url", EnvKind::Str),
    ("REDIS_HOST", "redis_host", EnvKind::Str),
    ("REDIS_PORT", "redis_port", EnvKind::Int),
    ("REDIS_DB", "redis_db", EnvKind::Int),
    ("SESSION_TIMEOUT", "session_timeout", EnvKind::Int),
    ("LOG_LEVEL", "log_level", EnvKind::Str),
    ("LOG_FILE", "log_file", EnvKind::Str),
    ("LOG_RETENTION_DAYS", "log_retention_days", EnvKind::Int),
    ("MAX_RETRIES", "max_retries", EnvKind::Int),
    ("TIMEOUT_SECONDS", "timeout_seconds", EnvKind::Int),
    (
        "MAX_CONCURRENT_MODEL_CALLS",
        "max_concurrent_model_calls",
        EnvKind::Int,
    ),
    ("CORS_ORIGINS", "cors_origins", EnvKind::Csv),
];

impl Settings {
    /// Layers, later wins: defaults, optional JSON file, process environment,
    /// then `cli_overrides`.
    pub async fn load(file: Option<&Path>, cli_overrides: Option<Value>) -> ConfigResult<Self> {
        let file_layer = match file {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };
        let env = env_layer(|key| std::env::var(key).ok())?;
        Self::from_layers(&[file_layer, env, cli_overrides.unwrap_or_else(empty_object)])
    }

    pub fn from_layers(layers: &[Value]) -> ConfigResult<Self> {
        let mut merged = serde_json::to_value(Settings::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for layer in layers {
            deep_merge(&mut merged, layer);
        }
        let settings: Settings =
            serde_json::from_value(merged).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.secret_key.trim().is_empty() {
            return Err(ConfigError::Invalid("secret_key must not be empty".to_string()));
        }
        if !matches!(self.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
            return Err(ConfigError::InvalidValue {
                key: "algorithm".to_string(),
                value: self.algorithm.clone(),
                reason: "expected HS256, HS384 or HS512",
            });
        }
        let positive = [
            ("access_token_expire_minutes", self.access_token_expire_minutes > 0),
            ("session_timeout", self.session_timeout > 0),
            ("timeout_seconds", self.timeout_seconds > 0),
            ("max_concurrent_model_calls", self.max_concurrent_model_calls > 0),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }
        Ok(())
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret_key == DEFAULT_SECRET_KEY
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.access_token_expire_minutes)
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            max_concurrent_calls: self.max_concurrent_model_calls,
            timeout: Duration::from_secs(self.timeout_seconds),
            max_retries: self.max_retries,
            ..CallPolicy::default()
        }
    }

    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
            default_provider: self.default_provider.clone(),
            policy: self.call_policy(),
        }
    }

    /// Model id pinned for the default provider, if any.
    pub fn default_model(&self) -> Option<String> {
        let provider = self.default_provider.as_deref().unwrap_or("openai");
        self.providers
            .get(provider)
            .and_then(|p| p.default_model.clone())
    }

    /// JSON view safe to log: secrets replaced by a marker.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| empty_object());
        if let Some(root) = value.as_object_mut() {
            root.insert("secret_key".to_string(), json!("***"));
            if let Some(url) = root.get_mut("database_url") {
                if !url.is_null() {
                    *url = json!("***");
                }
            }
            if let Some(providers) = root.get_mut("providers").and_then(Value::as_object_mut) {
                for provider in providers.values_mut() {
                    if let Some(key) = provider.get_mut("api_key") {
                        if !key.is_null() {
                            *key = json!("***");
                        }
                    }
                }
            }
        }
        value
    }
}

/// Builds the environment layer from `lookup`. Blank values are ignored;
/// values that do not parse as their declared kind are errors.
pub fn env_layer<F>(lookup: F) -> ConfigResult<Value>
where
    F: Fn(&str) -> Option<String>,
{
    let mut root = Map::new();
    for (env_key, key, kind) in ENV_KEYS {
        let Some(raw) = lookup(*env_key).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        let value = match kind {
            EnvKind::Str => json!(raw.trim()),
            EnvKind::Bool => json!(parse_bool_like(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: env_key.to_string(),
                    value: raw.clone(),
                    reason: "expected a boolean",
                }
            })?),
            EnvKind::Int => json!(raw.trim().parse::<i64>().map_err(|_| {
                ConfigError::InvalidValue {
                    key: env_key.to_string(),
                    value: raw.clone(),
                    reason: "expected an integer",
                }
            })?),
            EnvKind::Csv => json!(parse_csv(&raw)),
        };
        root.insert((*key).to_string(), value);
    }

    let mut layer = Value::Object(root);
    let api_key = lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty());
    let base_url = lookup("OPENAI_BASE_URL").filter(|v| !v.trim().is_empty());
    let model = lookup("OPENAI_MODEL").filter(|v| !v.trim().is_empty());
    if api_key.is_some() || base_url.is_some() || model.is_some() {
        deep_merge(
            &mut layer,
            &json!({
                "providers": {
                    "openai": {
                        "api_key": api_key,
                        "url": base_url.unwrap_or_else(|| OPENAI_DEFAULT_URL.to_string()),
                        "default_model": model.unwrap_or_else(|| "gpt-4o".to_string())
                    }
                }
            }),
        );
    }
    if let Some(api_key) = lookup("OPENROUTER_API_KEY").filter(|v| !v.trim().is_empty()) {
        deep_merge(
            &mut layer,
            &json!({"providers": {"openrouter": {"api_key": api_key}}}),
        );
    }
    if let Some(url) = lookup("OLLAMA_URL").filter(|v| !v.trim().is_empty()) {
        deep_merge(&mut layer, &json!({"providers": {"ollama": {"url": url}}}));
    }
    Ok(layer)
}

async fn read_json_file(path: &Path) -> ConfigResult<Value> {
    let raw = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::from_layers(&[]).expect("defaults");
        assert_eq!(settings.app_name, "Enterprise AI Agent");
        assert_eq!(settings.algorithm, "HS256");
        assert_eq!(settings.access_token_expire_minutes, 30);
        assert_eq!(settings.session_timeout, 3600);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.timeout_seconds, 30);
        assert_eq!(settings.max_concurrent_model_calls, 8);
        assert_eq!(settings.cors_origins, vec!["http://localhost:3000"]);
        assert!(settings.uses_default_secret());
    }

    #[test]
    fn env_overrides_file_and_cli_overrides_env() {
        let file = json!({"app_name": "From File", "session_timeout": 60, "port": 9000});
        let env = env_layer(lookup(&[
            ("APP_NAME", "From Env"),
            ("SESSION_TIMEOUT", "120"),
            ("CORS_ORIGINS", "http://a.test, http://b.test"),
        ]))
        .expect("env");
        let cli = json!({"session_timeout": 5});

        let settings = Settings::from_layers(&[file, env, cli]).expect("settings");
        assert_eq!(settings.app_name, "From Env");
        assert_eq!(settings.session_timeout, 5);
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn openai_env_becomes_provider_entry() {
        let env = env_layer(lookup(&[
            ("OPENAI_API_KEY", "sk-live"),
            ("OPENAI_MODEL", "gpt-4o-mini"),
        ]))
        .expect("env");
        let settings = Settings::from_layers(&[env]).expect("settings");
        let openai = settings.providers.get("openai").expect("openai");
        assert_eq!(openai.api_key.as_deref(), Some("sk-live"));
        assert_eq!(openai.url.as_deref(), Some(OPENAI_DEFAULT_URL));
        assert_eq!(settings.default_model().as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn non_numeric_env_value_is_an_error() {
        let err = env_layer(lookup(&[("TIMEOUT_SECONDS", "soon")])).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(err.to_string().contains("TIMEOUT_SECONDS"));
    }

    #[test]
    fn out_of_range_port_is_an_error() {
        let env = env_layer(lookup(&[("PORT", "70000")])).expect("env");
        assert!(matches!(
            Settings::from_layers(&[env]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_limits_and_asymmetric_algorithms_are_rejected() {
        assert!(Settings::from_layers(&[json!({"max_concurrent_model_calls": 0})]).is_err());
        assert!(Settings::from_layers(&[json!({"session_timeout": 0})]).is_err());
        assert!(Settings::from_layers(&[json!({"algorithm": "RS256"})]).is_err());
    }

    #[test]
    fn policy_carries_retry_and_timeout() {
        let settings =
            Settings::from_layers(&[json!({"max_retries": 1, "timeout_seconds": 7})]).expect("ok");
        let policy = settings.call_policy();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.timeout, Duration::from_secs(7));
        assert_eq!(policy.max_concurrent_calls, 8);
    }

    #[test]
    fn redacted_view_hides_secrets() {
        let settings = Settings::from_layers(&[json!({
            "secret_key": "topsecret",
            "providers": {"openai": {"api_key": "sk-live"}}
        })])
        .expect("settings");
        let text = settings.redacted().to_string();
        assert!(!text.contains("topsecret"));
        assert!(!text.contains("sk-live"));
    }

    #[tokio::test]
    async fn load_reads_json_file_layer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("concierge.json");
        std::fs::write(&path, r#"{"app_name": "Filed", "max_retries": 0}"#).expect("write");
        let settings = Settings::load(Some(&path), Some(json!({"debug": true})))
            .await
            .expect("load");
        assert_eq!(settings.max_retries, 0);
        assert!(settings.debug);
    }

    #[tokio::test]
    async fn load_reports_broken_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").expect("write");
        let err = Settings::load(Some(&path), None).await.expect_err("broken");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
