use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use concierge_core::{Orchestrator, Settings};
use concierge_observability::{
    emit_event, init_process_logging, LogDestination, ObservabilityEvent, ProcessKind,
};
use concierge_providers::ProviderRegistry;
use concierge_server::{serve, AppState};
use concierge_tools::ActionRegistry;
use concierge_types::HistoryTurn;
use serde_json::{json, Map, Value};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

const SUPPORTED_PROVIDER_IDS: [&str; 3] = ["openai", "openrouter", "ollama"];

#[derive(Parser, Debug)]
#[command(name = "concierge-engine")]
#[command(about = "Authenticated natural-language query service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct ModelArgs {
    /// JSON settings file layered under the environment.
    #[arg(long, env = "CONCIERGE_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service.
    Serve {
        #[arg(long, alias = "hostname")]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Plan and answer one query locally and print the outcome as JSON.
    Run {
        query: String,
        /// Role whose grants gate the plan.
        #[arg(long, default_value = "admin")]
        role: String,
        /// Prior turns as JSON: inline, `@path`, or `-` for stdin.
        #[arg(long)]
        history: Option<String>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print an Argon2 hash suitable for a seeded credential record.
    HashPassword { password: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { host, port, model } => {
            let mut overrides = build_cli_overrides(model.api_key, model.provider, model.model)?
                .unwrap_or_else(|| Value::Object(Map::new()));
            if let Some(root) = overrides.as_object_mut() {
                if let Some(host) = host {
                    root.insert("host".to_string(), json!(host));
                }
                if let Some(port) = port {
                    root.insert("port".to_string(), json!(port));
                }
            }
            let settings = Settings::load(model.config.as_deref(), Some(overrides)).await?;
            let _log_guard = start_logging(ProcessKind::Server, &settings)?;
            if settings.uses_default_secret() {
                tracing::warn!("SECRET_KEY is the built-in default; set it before exposing the service");
            }

            let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
                .parse()
                .context("invalid host or port")?;
            info!(
                "starting {} v{} on {}",
                settings.app_name, settings.app_version, addr
            );
            let model_id = settings.default_model();
            let state = AppState::from_settings(settings)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "server.starting",
                    component: "engine.main",
                    model_id: model_id.as_deref(),
                    status: Some("ok"),
                    ..Default::default()
                },
            );
            serve(addr, state).await?;
        }
        Command::Run {
            query,
            role,
            history,
            model,
        } => {
            let overrides = build_cli_overrides(model.api_key, model.provider, model.model)?;
            let settings = Settings::load(model.config.as_deref(), overrides).await?;
            let _log_guard = start_logging(ProcessKind::Cli, &settings)?;
            let history = match history {
                Some(raw) => parse_history(&read_json_input(&raw)?)?,
                None => Vec::new(),
            };

            let orchestrator = Orchestrator::new(
                ProviderRegistry::new(settings.providers_config()),
                ActionRegistry::new(),
            )
            .with_model(settings.default_model())
            .with_process(ProcessKind::Cli);
            let permissions = concierge_auth::RoleGrants.permissions_for(&role);
            let context = json!({
                "user": {"role": role},
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "user_agent": "cli",
            });
            let outcome = orchestrator
                .plan_and_execute(&query, &context, &history, &permissions)
                .await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::HashPassword { password } => {
            println!("{}", concierge_auth::hash_password(&password)?);
        }
    }

    Ok(())
}

fn start_logging(
    process: ProcessKind,
    settings: &Settings,
) -> anyhow::Result<WorkerGuard> {
    let destination = LogDestination::from_log_file(&settings.log_file);
    let (guard, log_info) = init_process_logging(
        process,
        &destination,
        &settings.log_level,
        settings.log_retention_days,
    )?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("logging initialized: {:?}", log_info);
    tracing::debug!("effective settings: {}", settings.redacted());
    Ok(guard)
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = Map::new();
    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }

    // Keyless providers such as ollama are only built when they have an entry.
    let target_provider = provider.as_deref().unwrap_or("openai");
    let mut provider_config = Map::new();
    if let Some(k) = api_key {
        provider_config.insert("api_key".to_string(), Value::String(k));
    }
    if let Some(m) = model {
        provider_config.insert("default_model".to_string(), Value::String(m));
    }
    root.insert(
        "providers".to_string(),
        json!({ target_provider: Value::Object(provider_config) }),
    );

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn read_json_input(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn parse_history(value: &Value) -> anyhow::Result<Vec<HistoryTurn>> {
    serde_json::from_value(value.clone())
        .context("history must be a JSON array of {\"role\", \"content\"} objects")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_cli_overrides_targets_selected_provider() {
        let overrides = build_cli_overrides(
            Some("sk-test".to_string()),
            Some("openrouter".to_string()),
            Some("openai/gpt-4o".to_string()),
        )
        .expect("overrides")
        .expect("some");

        assert_eq!(overrides["default_provider"], "openrouter");
        assert_eq!(
            overrides["providers"]["openrouter"]["api_key"],
            json!("sk-test")
        );
        assert_eq!(
            overrides["providers"]["openrouter"]["default_model"],
            json!("openai/gpt-4o")
        );
    }

    #[test]
    fn build_cli_overrides_defaults_to_openai_without_provider() {
        let overrides = build_cli_overrides(None, None, Some("gpt-4o-mini".to_string()))
            .expect("overrides")
            .expect("some");
        assert!(overrides.get("default_provider").is_none());
        assert!(overrides["providers"]["openai"].get("api_key").is_none());
        assert_eq!(
            overrides["providers"]["openai"]["default_model"],
            json!("gpt-4o-mini")
        );
    }

    #[tokio::test]
    async fn selecting_ollama_alone_builds_the_ollama_provider() {
        let overrides = build_cli_overrides(None, Some("ollama".to_string()), None)
            .expect("overrides")
            .expect("some");
        assert_eq!(overrides["providers"]["ollama"], json!({}));

        let settings = Settings::from_layers(&[overrides]).expect("settings");
        let ids = ProviderRegistry::new(settings.providers_config())
            .list()
            .await
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert!(ids.iter().any(|id| id == "ollama"));
    }

    #[test]
    fn no_flags_means_no_overrides() {
        assert!(build_cli_overrides(None, None, None)
            .expect("overrides")
            .is_none());
    }

    #[test]
    fn normalize_and_validate_provider_is_case_insensitive() {
        let provider =
            normalize_and_validate_provider(Some(" OpenRouter ".to_string())).expect("provider");
        assert_eq!(provider.as_deref(), Some("openrouter"));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = normalize_and_validate_provider(Some("openruter".to_string())).unwrap_err();
        assert!(err.to_string().contains("unsupported provider `openruter`"));
    }

    #[test]
    fn history_parses_inline_json() {
        let value = read_json_input(r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]"#)
            .expect("json");
        let turns = parse_history(&value).expect("history");
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1], HistoryTurn::new("assistant", "hello"));
    }

    #[test]
    fn history_rejects_wrong_shape() {
        assert!(parse_history(&json!({"role": "user"})).is_err());
    }

    #[test]
    fn cli_parses_run_with_flattened_model_args() {
        let cli = Cli::try_parse_from([
            "concierge-engine",
            "run",
            "find our Q3 report",
            "--role",
            "viewer",
            "--provider",
            "ollama",
        ])
        .expect("parse");
        let Command::Run {
            query, role, model, ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(query, "find our Q3 report");
        assert_eq!(role, "viewer");
        assert_eq!(model.provider.as_deref(), Some("ollama"));
    }
}
