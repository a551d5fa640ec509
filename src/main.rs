use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use signal_watch::api::admin_routes;
use signal_watch::channels::{ChannelAccessProbe, ChannelAccessRegistry, ChannelPoller};
use signal_watch::classifier::{ClassificationClient, OpenAiClassifier};
use signal_watch::config::{AppConfig, ClassifierConfig, ProbeConfig};
use signal_watch::gateway::{EventHandler, GatewayConnectionManager};
use signal_watch::service::PipelineService;
use signal_watch::store::{Database, LibSqlBackend};

/// Longest wait for a background task during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: a rustls crypto provider was already installed");
    }

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    // Guard must live until exit so buffered file logs are flushed.
    let _log_guard = init_tracing(&config);

    let classifier_config = ClassifierConfig::from_env().context("Classifier is not configured")?;

    eprintln!("📡 Signal Watch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", classifier_config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Admin API: http://0.0.0.0:{}/api/pipeline/stats", config.admin_port);
    eprintln!(
        "   Gateway: {}\n",
        if config.gateway.is_some() { "enabled" } else { "disabled (no token)" }
    );

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .context("Failed to open database")?,
    );

    let classifier: Arc<dyn ClassificationClient> = Arc::new(
        OpenAiClassifier::new(classifier_config).context("Failed to create classifier")?,
    );

    let registry = Arc::new(
        ChannelAccessRegistry::load(Arc::clone(&store), &config.probe)
            .await
            .context("Failed to load channel access state")?,
    );

    // Bad credentials must surface before any loop starts.
    let probe = Arc::new(ChannelAccessProbe::new(config.probe.clone(), Arc::clone(&registry)));
    let channel_ids = resolve_channels(&probe, &config.probe).await?;

    let service = Arc::new(
        PipelineService::new(Arc::clone(&store), classifier, config.pipeline.clone())
            .context("Failed to build pipeline")?
            .with_registry(Arc::clone(&registry)),
    );
    let handler: Arc<dyn EventHandler> = service.ingestor();

    let recovered = service
        .recover_unprocessed(config.recover_limit.min(config.pipeline.max_queue_size))
        .await
        .context("Failed to recover unprocessed messages")?;
    tracing::info!(recovered, "Startup recovery complete");

    service.start().await;

    let shutdown = CancellationToken::new();

    // Channel poller (REST sync cycle, doubles as permission probe)
    let poller_handle = if !config.probe.poll_interval.is_zero() && !channel_ids.is_empty() {
        let poller = ChannelPoller::new(
            Arc::clone(&probe),
            Arc::clone(&handler),
            channel_ids.clone(),
            config.probe.poll_interval,
        );
        Some(poller.spawn(shutdown.child_token()))
    } else {
        tracing::info!("Channel poller disabled");
        None
    };

    // Admin HTTP server
    let app = admin_routes(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.admin_port))
        .await
        .with_context(|| format!("Failed to bind admin port {}", config.admin_port))?;
    tracing::info!(port = config.admin_port, "Admin API started");
    let server_shutdown = shutdown.child_token();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Admin server failed");
        }
    });

    // Gateway runs in the foreground until Ctrl+C or a fatal error
    let gateway_result = match config.gateway.clone() {
        Some(mut gateway_config) => {
            gateway_config.channel_ids = channel_ids;
            let manager = GatewayConnectionManager::new(gateway_config, Arc::clone(&handler))
                .with_registry(Arc::clone(&registry));
            let gateway_cancel = shutdown.child_token();
            tokio::select! {
                result = manager.run(gateway_cancel.clone()) => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                    gateway_cancel.cancel();
                    Ok(())
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            tracing::info!("Shutdown requested");
            Ok(())
        }
    };

    // Stop in reverse order of startup
    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, server_handle).await.is_err() {
        tracing::warn!("Admin server did not stop in time");
    }
    if let Some(handle) = poller_handle
        && tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err()
    {
        tracing::warn!("Channel poller did not stop in time");
    }
    service.stop().await;
    tracing::info!("Signal Watch stopped");

    if let Err(e) = gateway_result {
        tracing::error!(error = %e, "Gateway stopped with a fatal error");
        return Err(e).context("Gateway failed");
    }
    Ok(())
}

/// Verify the source token and settle the channels to watch. Invalid
/// credentials abort startup; other failures fall back to the configured list.
async fn resolve_channels(
    probe: &ChannelAccessProbe,
    config: &ProbeConfig,
) -> anyhow::Result<Vec<String>> {
    if !config.has_token() {
        return Ok(config.channel_ids.clone());
    }
    if let Err(e) = probe.verify_token().await {
        if e.is_fatal() {
            return Err(e).context("Source token rejected");
        }
        tracing::warn!(error = %e, "Could not verify source token");
        return Ok(config.channel_ids.clone());
    }
    if !config.discover {
        return Ok(config.channel_ids.clone());
    }
    match probe.discover_channels(&config.channel_ids).await {
        Ok(channels) => {
            for channel in &channels {
                tracing::info!(channel_id = %channel.id, name = %channel.name, "Watching channel");
            }
            Ok(channels.into_iter().map(|c| c.id).collect())
        }
        Err(e) if e.is_fatal() => Err(e).context("Source token rejected"),
        Err(e) => {
            tracing::warn!(error = %e, "Channel discovery failed, using configured channels");
            Ok(config.channel_ids.clone())
        }
    }
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "signal-watch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
