use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voicecore::{Config, PhoneEvent, SessionController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let path = env::args().nth(1).unwrap_or_else(|| "voicecore.toml".to_string());
    let config = Config::load(&path)?;

    // Initialize tracing, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting voicecore {}", env!("CARGO_PKG_VERSION"));
    info!(
        "Account {}@{}:{}",
        config.account.username, config.account.server_host, config.account.server_port
    );

    let (controller, mut events) = SessionController::start(config).await?;

    let outcome = controller.register().await;
    if !outcome.success {
        warn!("Registration did not complete: {:?}", outcome.status);
    }

    let listener = controller.clone();
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("{}: {:?}", event.event_type(), event);
            if let PhoneEvent::IncomingCall { call_id, .. } = &event {
                // headless mode: nobody to pick up
                if let Err(e) = listener.reject(call_id).await {
                    error!("Failed to reject {}: {}", call_id, e);
                }
            }
        }
    });

    info!("voicecore running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down voicecore");
    controller.shutdown().await;
    event_task.abort();

    Ok(())
}
