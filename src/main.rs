//! Telephony bridge service: media WebSocket server plus webhook surface,
//! wired to the configured carrier adapter.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use telephony_core::{
    AdapterMap, LogJournal, MediaServer, PlivoAdapter, ProviderKind, StaticAgentDirectory,
    StubPipelineFactory, TataAdapter, TelephonyAdapter, TelephonyConfig, TelephonyManager,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TELEPHONY_CONFIG").ok())
        .unwrap_or_else(|| "telephony.json".to_string());
    let config = TelephonyConfig::load(Path::new(&config_path))?;
    info!("starting telephony bridge ({})", config.provider);

    let (events_tx, events_rx) = mpsc::channel(256);
    let adapter: Arc<dyn TelephonyAdapter> = match config.provider {
        ProviderKind::PlivoLike => Arc::new(PlivoAdapter::new(&config, events_tx)?),
        ProviderKind::TataLike => Arc::new(TataAdapter::new(&config, events_tx)?),
    };

    let manager = TelephonyManager::new(
        Arc::new(StubPipelineFactory::default()),
        Arc::new(StaticAgentDirectory::new()),
        Arc::new(LogJournal),
        config.defaults.clone(),
        config.system_prompt.clone(),
    );
    manager.register_adapter(adapter.clone());
    tokio::spawn(manager.clone().run(events_rx));

    let adapters: AdapterMap = Arc::new(HashMap::from([(config.provider, adapter)]));

    let media = MediaServer::bind(&config.media_bind_addr, adapters.clone()).await?;
    tokio::spawn(async move {
        if let Err(err) = media.run().await {
            error!("media server exited: {err}");
        }
    });

    let http = tokio::net::TcpListener::bind(&config.http_bind_addr).await?;
    info!("webhook server listening on {}", http.local_addr()?);
    let app = telephony_core::webhook::router(adapters);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(http, app).await {
            error!("webhook server exited: {err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}
