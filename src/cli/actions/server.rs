use crate::api;
use crate::authflow::deps::{Dependencies, OtpConfig, PasswordPolicy, WindowRateLimiter};
use crate::authflow::notify::{BroadcastNotifier, Notifier, PgNotifier};
use crate::authflow::session::SessionOptionsResolver;
use crate::authflow::store::{InstanceStore, Lifetime, MemoryStore, PgStore};
use crate::authflow::{FlowConfig, FlowService, FlowServiceConfig, Registry};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

const RATE_LIMIT_ATTEMPTS: u32 = 10;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(5 * 60);
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub flow_ttl: Duration,
    pub flow_max_lifetime: Duration,
    pub flow_config_path: Option<String>,
    pub bind_user_agent: bool,
    pub cookie_secure: bool,
    pub password_min_length: usize,
    pub default_redirect_uri: String,
    pub otp: OtpConfig,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the flow config is invalid, the database is
/// unreachable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let flows = load_flows(args.flow_config_path.as_deref())?;
    let registry = Arc::new(Registry::with_builtin_steps()?);
    let lifetime = Lifetime::new(args.flow_ttl, args.flow_max_lifetime);

    let (store, notifier): (Arc<dyn InstanceStore>, Arc<dyn Notifier>) = match &args.dsn {
        Some(dsn) => {
            let store = PgStore::connect(dsn.expose_secret(), lifetime).await?;
            let notifier = PgNotifier::listen(store.pool().clone())
                .await
                .context("Failed to listen for flow notifications")?;
            spawn_purge(store.clone());
            (Arc::new(store), Arc::new(notifier))
        }
        None => (
            Arc::new(MemoryStore::new(lifetime)),
            Arc::new(BroadcastNotifier::default()),
        ),
    };

    let deps = Dependencies::in_memory(args.otp)
        .with_password_policy(PasswordPolicy {
            min_length: args.password_min_length,
        })
        .with_rate_limiter(Arc::new(WindowRateLimiter::new(
            RATE_LIMIT_ATTEMPTS,
            RATE_LIMIT_WINDOW,
        )));

    let resolver = SessionOptionsResolver::default()
        .with_bind_user_agent(args.bind_user_agent)
        .with_cookie_secure(args.cookie_secure);

    let service = FlowService::new(registry, deps, store, notifier, flows)?
        .with_resolver(resolver)
        .with_config(FlowServiceConfig::new().with_default_redirect_uri(&args.default_redirect_uri));

    api::serve(args.port, Arc::new(service)).await
}

fn load_flows(path: Option<&str>) -> Result<FlowConfig> {
    let Some(path) = path else {
        debug!("Using built-in flow definitions");
        return Ok(FlowConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow config {path}"))?;
    FlowConfig::from_json(&raw).with_context(|| format!("Invalid flow config {path}"))
}

fn spawn_purge(store: PgStore) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(err) = store.purge_expired().await {
                warn!("Failed to purge expired flows: {err}");
            }
        }
    });
}

fn log_startup_args(args: &Args) {
    let backend = if args.dsn.is_some() {
        "postgres"
    } else {
        "memory"
    };
    info!(
        port = args.port,
        backend,
        flow_ttl_seconds = args.flow_ttl.as_secs(),
        flow_max_lifetime_seconds = args.flow_max_lifetime.as_secs(),
        flow_config = args.flow_config_path.as_deref().unwrap_or("built-in"),
        bind_user_agent = args.bind_user_agent,
        cookie_secure = args.cookie_secure,
        "Starting authflow server"
    );
}
