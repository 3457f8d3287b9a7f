pub mod config;
pub mod orchestrator;

pub use config::{env_layer, ConfigError, ConfigResult, Settings, DEFAULT_SECRET_KEY};
pub use orchestrator::{
    missing_permissions, parse_plan, OrchestrationOutcome, Orchestrator, GENERIC_APOLOGY,
    INSUFFICIENT_PERMISSIONS,
};
