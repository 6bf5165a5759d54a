use anyhow::{Context, Result};
use ezsp_uart_driver::{connect, setup_logging, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    setup_logging(settings.loglevel);

    let gateway = connect(&settings).context("Unable to open the serial port")?;
    let startup = gateway.reset().await.context("NCP reset failed")?;
    info!(
        reset_code = startup.reset_code,
        protocol_version = startup.protocol_version,
        "Connected to the NCP"
    );
    gateway
        .configure()
        .await
        .context("Unable to push the configured NCP settings")?;

    gateway
        .add_callback(Box::new(|name, fields| {
            info!(callback = name, ?fields, "NCP callback");
        }))
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
