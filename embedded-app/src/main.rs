//! Development server: serves the embedded app over TCP on the bridge's
//! configured origin, so it can be opened in an ordinary browser.

use protocol_bridge::BridgeConfig;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BridgeConfig::from_env()?;
    if !config.dev {
        warn!("BRIDGE_DEV is not set; serving over TCP anyway");
    }
    if config.https {
        warn!("TLS is not terminated by the development server; serving plain http");
    }

    let addr = format!("{}:{}", config.hostname, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    embedded_app::run(listener).await?;
    Ok(())
}
