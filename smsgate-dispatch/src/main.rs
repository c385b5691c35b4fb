use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use smsgate_dispatch::api::{self, ApiState};
use smsgate_dispatch::{
    Config, DeviceConnector, DeviceRegistry, EventSink, LogSink, MonitorSettings,
    NotificationHistory, Supervisor, SupervisorSettings, TelegramSink, spawn_dispatcher,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EVENT_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "Forward SMS and incoming calls from GSM modems")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "smsgate.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "smsgate_dispatch=info,smsgate_at=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        devices = config.devices.len(),
        poll_interval_seconds = config.poll_interval_seconds,
        delete_after_forward = config.delete_after_forward,
        "Starting smsgate"
    );

    let sink: Arc<dyn EventSink> = match &config.telegram {
        Some(telegram) => {
            let sink = TelegramSink::new(telegram)?;
            if let Err(e) = sink.verify().await {
                warn!(error = %e, "Could not verify telegram bot, continuing");
            }
            Arc::new(sink)
        }
        None => {
            info!("No telegram section, events go to the log");
            Arc::new(LogSink)
        }
    };

    let history = match &config.history {
        Some(history) => {
            info!(path = ?history.path, "Using notification history");
            Some(NotificationHistory::new(&history.path).await?)
        }
        None => None,
    };

    let names: Vec<_> = config.devices.iter().map(|d| d.name.as_str()).collect();
    if let Err(e) = sink
        .announce(&format!("smsgate started, monitoring {}", names.join(", ")))
        .await
    {
        warn!(error = %e, "Failed to send start-up notice");
    }

    let cancel = CancellationToken::new();
    let registry = DeviceRegistry::new();
    let (publisher, dispatcher) = spawn_dispatcher(Arc::clone(&sink), history.clone(), EVENT_BUFFER);

    let supervisor = Supervisor::new(
        config.devices.clone(),
        MonitorSettings::from(&config),
        SupervisorSettings::from(&config),
        Arc::new(DeviceConnector::new(cancel.child_token())),
        publisher,
        registry.clone(),
    );
    let devices = supervisor.spawn(cancel.clone()).await;

    let server = match &config.server {
        Some(server) => {
            let app = api::router(ApiState {
                registry: registry.clone(),
                history,
            });
            let listener = TcpListener::bind(server.http_addr).await?;
            info!(http_addr = %server.http_addr, "HTTP server listening");

            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await;
                if let Err(e) = result {
                    error!(error = ?e, "HTTP server error");
                }
                info!("HTTP server shut down");
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    for handle in devices {
        let _ = handle.await;
    }
    if let Some(server) = server {
        let _ = server.await;
    }
    // Monitors held the last publishers.
    let _ = dispatcher.await;

    if let Err(e) = sink.announce("smsgate stopped").await {
        warn!(error = %e, "Failed to send shutdown notice");
    }

    info!("smsgate shut down complete");
    Ok(())
}
