use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use fhir_tbs::server;
use fhir_tbs::DefinitionSet;
use fhir_tbs::DefinitionSetBuilder;
use fhir_tbs::Error;
use fhir_tbs::HandlerError;
use fhir_tbs::Resource;
use fhir_tbs::Result;
use fhir_tbs::SubscriptionHandler;
use fhir_tbs::TbsBuilder;
use fhir_tbs::TbsConfig;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Logs every delivered event.
struct LoggingHandler;

#[async_trait]
impl SubscriptionHandler<()> for LoggingHandler {
    async fn handle(
        &self,
        _ctx: &(),
        reference: &str,
        included: Vec<Resource>,
        timestamp: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), HandlerError> {
        info!(
            reference,
            included = included.len(),
            timestamp = ?timestamp,
            "event delivered"
        );
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = TbsConfig::new()?.without_unreachable_management().validate()?;
    let definitions = declared_definitions(&config)?;
    let socket_addr = config.server.socket_addr()?;

    let (graceful_tx, graceful_rx) = watch::channel(());

    let node = TbsBuilder::new(config, graceful_rx.clone())
        .definitions(definitions)
        .build()?;

    if let Some(report) = node.start().await? {
        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            failures = report.failures.len(),
            "initial reconciliation finished"
        );
    }

    let listener = tokio::spawn(server::serve(node.routes(Arc::new(())), socket_addr, graceful_rx));

    info!("Application started. Waiting for CTRL+C signal...");
    wait_for_signal().await?;

    node.stop().await;
    if let Err(e) = graceful_tx.send(()) {
        error!("Failed to send shutdown signal: {}", e);
    }
    listener.await??;

    info!("Shutdown completed");
    Ok(())
}

fn declared_definitions(config: &TbsConfig) -> Result<DefinitionSet<()>> {
    let handler: Arc<dyn SubscriptionHandler<()>> = Arc::new(LoggingHandler);
    config
        .subscriptions
        .iter()
        .fold(
            DefinitionSetBuilder::new().defaults(config.defaults.clone()),
            |builder, entry| builder.subscribe(entry.to_subscription(handler.clone())),
        )
        .build()
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint =
        signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(format!("failed to install SIGINT handler: {e}")))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| Error::Fatal(format!("failed to install SIGTERM handler: {e}")))?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }
    Ok(())
}
