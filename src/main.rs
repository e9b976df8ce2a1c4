use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use mcx_bridge::config::Config;
use mcx_bridge::metadata::BasicExtractor;
use mcx_bridge::stdio::{self, StdioHost};
use mcx_bridge::tty::DevicePicker;
use mcx_bridge::{LifecycleController, SerialBridge, ViewObserver};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the host protocol, logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    log::info!("Starting mcx bridge");

    let config = Config::from_env().context("Invalid configuration")?;

    let (host, writer) = StdioHost::new(tokio::io::stdout());
    let picker = Arc::new(DevicePicker::new(config.serial_port.clone()));
    let bridge = Arc::new(SerialBridge::new(picker));
    let controller = LifecycleController::new(
        host.clone(),
        Arc::new(BasicExtractor),
        bridge.clone(),
        config.lifecycle_settings(),
    );

    let view: Arc<dyn ViewObserver> = host.clone();
    controller.subscribe(&view);

    // Close the serial link on Ctrl+C / SIGTERM before exiting
    let runtime = tokio::runtime::Handle::current();
    let bridge_for_signal = bridge.clone();
    ctrlc::set_handler(move || {
        log::info!("Received interrupt signal, closing serial link...");
        runtime.block_on(async {
            if tokio::time::timeout(Duration::from_secs(2), bridge_for_signal.close())
                .await
                .is_err()
            {
                log::warn!("Serial link did not close in time");
            }
        });
        std::process::exit(0);
    })
    .context("Failed to set Ctrl+C handler")?;

    if config.serial_autoconnect {
        match controller.serial_request(&[]).await {
            Ok(status) => log::info!("Serial link up: {:?}", status.info),
            Err(e) => {
                // Keep running; the user can connect later
                log::error!("Failed to connect serial port at startup: {}", e);
            }
        }
    }

    stdio::run(tokio::io::stdin(), host, controller.clone()).await?;

    bridge.close().await;
    drop(view);
    drop(controller);
    // Give queued host commands up to 2 seconds to drain
    match tokio::time::timeout(Duration::from_secs(2), writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Host writer ended abnormally: {}", e),
        Err(_) => log::warn!("Host writer did not drain in time"),
    }
    log::info!("Shut down");
    Ok(())
}
