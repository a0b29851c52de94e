//! `sluice-server`: HTTP entry point for the orchestration core.
//!
//! Reads `SLUICE_*` configuration, connects the store, broker and cluster
//! backends and serves the gateway routes until interrupted.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;

use sluice_core::observability::{init_logging, LogFormat};
use sluice_flow::broker::http::{RabbitManagementChannel, RabbitManagementConfig};
use sluice_flow::broker::BrokerChannel;
use sluice_flow::cluster::kubernetes::{KubernetesApi, KubernetesConfig};
use sluice_flow::cluster::ClusterApi;
use sluice_flow::codegen::StaticCodeGenerator;
use sluice_flow::config::{OrchestratorConfig, ServerConfig, StoreBackend};
use sluice_flow::error::{Error, Result};
use sluice_flow::gateway::RequestGateway;
use sluice_flow::metrics::init_metrics;
use sluice_flow::server::router;
use sluice_flow::store::memory::InMemoryStore;
use sluice_flow::store::Store;

fn log_format_from_env() -> LogFormat {
    match std::env::var("SLUICE_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[allow(clippy::unused_async)]
async fn connect_store(backend: &StoreBackend) -> Result<Arc<dyn Store>> {
    match backend {
        StoreBackend::Memory => {
            tracing::warn!("SLUICE_DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres { url } => {
            let store = sluice_flow::store::postgres::PostgresStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("connected to postgres store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackend::Postgres { .. } => Err(Error::configuration(
            "SLUICE_DATABASE_URL is set but sluice-server was built without the postgres feature",
        )),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let server_config = ServerConfig::from_env()?;
    let config = OrchestratorConfig::from_env()?;
    config.validate()?;
    init_metrics()?;

    let store = connect_store(&server_config.store).await?;

    let broker_config = RabbitManagementConfig::new(
        server_config.broker_api_url.clone(),
        server_config.broker_user.clone(),
        server_config.broker_password.clone(),
    )
    .with_vhost(server_config.broker_vhost.clone());
    let broker: Arc<dyn BrokerChannel> = Arc::new(
        RabbitManagementChannel::new(broker_config).map_err(|e| Error::broker(None, e))?,
    );

    let cluster_config = KubernetesConfig::new(server_config.cluster_api_url.clone())
        .with_token_path(server_config.cluster_token_path.clone());
    let cluster: Arc<dyn ClusterApi> = Arc::new(
        KubernetesApi::new(cluster_config)
            .await
            .map_err(|e| Error::cluster(None, e))?,
    );

    tracing::info!(
        namespace = %config.namespace,
        advertised_endpoint = %config.advertised_endpoint,
        "starting sluice-server"
    );
    let gateway = Arc::new(RequestGateway::new(
        config,
        store,
        Arc::clone(&broker),
        cluster,
        Arc::new(StaticCodeGenerator::default()),
    ));
    let app = router(gateway);

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))?;

    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "failed to close broker channel");
    }
    Ok(())
}
