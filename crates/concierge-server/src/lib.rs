use std::sync::Arc;

use concierge_auth::{Authenticator, InMemoryCredentialStore, RoleGrants, TokenService};
use concierge_core::{Orchestrator, Settings};
use concierge_memory::{InMemoryKvStore, SessionStore};
use concierge_providers::ProviderRegistry;
use concierge_tools::ActionRegistry;

mod http;

pub use http::{app_router, serve};

/// Everything a request handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub auth: Authenticator,
    pub grants: RoleGrants,
    pub kv: InMemoryKvStore,
    pub sessions: SessionStore,
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Wires the in-process backends: seeded credentials, in-memory sessions,
    /// the stub actions and whatever model providers `settings` configures.
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let store = Arc::new(InMemoryCredentialStore::seeded()?);
        let tokens = TokenService::new(&settings.secret_key, &settings.algorithm)?;
        let auth = Authenticator::new(store, tokens, settings.token_ttl());
        let providers = ProviderRegistry::new(settings.providers_config());
        let orchestrator = Orchestrator::new(providers, ActionRegistry::new())
            .with_model(settings.default_model());
        Ok(Self::new(settings, auth, orchestrator))
    }

    pub fn new(settings: Settings, auth: Authenticator, orchestrator: Orchestrator) -> Self {
        let kv = InMemoryKvStore::new();
        let sessions = SessionStore::new(Arc::new(kv.clone()), settings.session_ttl());
        Self {
            settings: Arc::new(settings),
            auth,
            grants: RoleGrants,
            kv,
            sessions,
            orchestrator,
        }
    }
}
