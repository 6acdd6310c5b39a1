use anyhow::{Context, Result};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::graphql::{self, FleetwatchSchema};
use crate::api::rest::{self, AppState};
use crate::config::{Config, LogFormat};
use crate::domain::fleet_service::FleetService;
use crate::domain::registry::NodeRegistry;
use crate::probe::{HttpProbe, Probe};
use crate::provisioner::{CommandProvisioner, PreinstalledProvisioner, Provisioner};
use crate::reconciler::{ReconcileTrigger, Reconciler};
use crate::scrape::reload::{NoReload, ReloadNotifier, Reloader};
use crate::scrape::store::ConfigStore;

pub fn init_tracing(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {e}");
    }
}

/// Everything the daemon and the one-shot commands share.
pub struct Components {
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<ConfigStore>,
    pub probe: Arc<dyn Probe>,
    pub reconciler: Arc<Reconciler>,
}

pub async fn build_components(config: &Config) -> Result<Components> {
    let data_dir = &config.registry.data_dir;
    let registry = Arc::new(
        NodeRegistry::open(data_dir)
            .await
            .with_context(|| format!("opening node registry under {}", data_dir.display()))?,
    );

    let store = Arc::new(ConfigStore::new(
        config.scrape.config_path.clone(),
        config.scrape.backup_dir.clone(),
        config.scrape.backup_retention,
    ));

    let probe: Arc<dyn Probe> = Arc::new(HttpProbe::new(
        config.probe.connect_timeout(),
        config.probe.metrics_timeout(),
        &config.scrape.metrics_path,
    )?);

    let reloader: Arc<dyn Reloader> = match &config.reload.url {
        Some(url) => Arc::new(ReloadNotifier::new(
            url,
            Duration::from_secs(config.reload.timeout_secs),
        )?),
        None => {
            warn!("reload.url not set, scrape config changes will not be pushed to the monitoring system");
            Arc::new(NoReload)
        }
    };

    let reconciler = Arc::new(Reconciler::new(
        registry.clone(),
        probe.clone(),
        store.clone(),
        reloader,
        config.reconcile_settings(),
    ));

    Ok(Components {
        registry,
        store,
        probe,
        reconciler,
    })
}

fn provisioner(config: &Config) -> Arc<dyn Provisioner> {
    match &config.provisioner.command {
        Some(command) => Arc::new(CommandProvisioner::new(
            command.clone(),
            config.provisioner.args.clone(),
        )),
        None => Arc::new(PreinstalledProvisioner),
    }
}

pub async fn run(config: Config) -> Result<()> {
    init_tracing(&config.daemon.log_level, config.daemon.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "fleetwatch daemon starting");

    let components = build_components(&config).await?;
    let trigger = ReconcileTrigger::new();

    let fleet = Arc::new(FleetService::new(
        components.registry.clone(),
        components.store.clone(),
        provisioner(&config),
        components.probe.clone(),
        trigger.clone(),
        config.provisioner.timeout(),
        config.scrape.job_prefix.clone(),
    ));

    let resumed = fleet.resume_pending().await;
    if resumed > 0 {
        info!(count = resumed, "resumed provisioning of pending nodes");
    }

    // Spawn the reconciliation loop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_loop = tokio::spawn(components.reconciler.clone().run(
        trigger,
        Duration::from_secs(config.reconcile.interval_secs),
        shutdown_rx,
    ));

    let app_state = AppState {
        fleet: fleet.clone(),
        reconciler: components.reconciler.clone(),
    };

    // Build GraphQL schema
    let schema = graphql::build_schema(fleet, components.reconciler.clone());

    // Build GraphQL sub-router with its own state
    let graphql_router = Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .with_state(schema);

    // Build Axum router: REST (with AppState) + GraphQL (with schema state)
    let app = rest::router(app_state)
        .merge(graphql_router)
        .layer(TraceLayer::new_for_http());

    // Bind HTTP listener
    let http_addr = &config.daemon.http_addr;
    let listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding to {}", http_addr))?;

    info!(
        addr = %http_addr,
        scrape_config = %config.scrape.config_path.display(),
        "HTTP server listening"
    );

    // Run HTTP server with graceful shutdown
    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_loop.await {
        warn!(error = %e, "reconciler task ended abnormally");
    }

    served?;
    info!("fleetwatch daemon stopped");
    Ok(())
}

async fn graphql_playground() -> Html<String> {
    Html(
        async_graphql::http::playground_source(
            async_graphql::http::GraphQLPlaygroundConfig::new("/graphql"),
        ),
    )
}

async fn graphql_handler(
    State(schema): State<FleetwatchSchema>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(req.into_inner()).await.into()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down"); },
        _ = terminate => { info!("Received SIGTERM, shutting down"); },
    }
}
