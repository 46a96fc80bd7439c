use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parkking::cache::{ListCaches, run_invalidator};
use parkking::config::Config;
use parkking::engine::Engine;
use parkking::feed::BookingFeed;
use parkking::housekeeping::run_compactor;
use parkking::http::{self, AppState};
use parkking::mailer::{LogNotifier, Notifier, Outbox, WebhookNotifier, run_dispatcher};
use parkking::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use parkking::wire::{self, StaffFactory};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    parkking::observability::init(config.metrics_port)?;
    let tls_acceptor =
        parkking::tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    std::fs::create_dir_all(&config.data_dir)?;

    let shutdown = CancellationToken::new();
    let (outbox, mail_rx) = Outbox::channel(config.outbox_capacity, config.operator_email.clone());
    let feed = Arc::new(BookingFeed::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        feed.clone(),
        outbox.clone(),
        config.policy,
    )?);

    let notifier: Arc<dyn Notifier> = match &config.mail_relay_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };
    tokio::spawn(run_dispatcher(mail_rx, notifier, config.from_email.clone()));

    let caches = ListCaches::new(config.cache_ttl, config.cache_enabled);
    tokio::spawn(run_invalidator(feed.subscribe(), caches.clone(), shutdown.clone()));
    let compactor = tokio::spawn(run_compactor(
        engine.clone(),
        config.compact_threshold,
        shutdown.clone(),
    ));

    // Public site
    let app = http::router(AppState::new(engine.clone(), caches, outbox, &config));
    let http_addr = format!("{}:{}", config.bind, config.http_port);
    let http_listener = TcpListener::bind(&http_addr).await?;
    let http_shutdown = shutdown.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    // Staff console
    let console_addr = format!("{}:{}", config.bind, config.console_port);
    let listener = TcpListener::bind(&console_addr).await?;
    let factory = Arc::new(StaffFactory::new(engine.clone(), config.console_password.clone()));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    info!("parkking site listening on http://{http_addr}");
    info!("parkking console listening on {console_addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!("  policy: {:?}", config.policy);
    info!("  mail: {}", config.mail_relay_url.as_deref().unwrap_or("log only"));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("console connection from {peer}");
                metrics::counter!(CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, factory, tls).await {
                        error!("console connection error from {peer}: {e}");
                    }
                    metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = shutdown.cancelled() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(DRAIN_TIMEOUT);
    tokio::pin!(drain_deadline);
    loop {
        if semaphore.available_permits() == max_connections {
            info!("all console connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} console connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    // Admin feed streams never finish on their own.
    match tokio::time::timeout(DRAIN_TIMEOUT, http_server).await {
        Ok(Ok(Ok(()))) => info!("site stopped"),
        Ok(Ok(Err(e))) => error!("site server error: {e}"),
        Ok(Err(e)) => error!("site server task failed: {e}"),
        Err(_) => warn!("site drain timeout, dropping open requests"),
    }
    if let Err(e) = compactor.await {
        error!("compactor task failed: {e}");
    }

    info!("parkking stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
