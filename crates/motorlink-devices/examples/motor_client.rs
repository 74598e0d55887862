use std::time::Duration;

use anyhow::Context;
use motorlink_core::config::ConfigBuilder;
use motorlink_core::logging;
use motorlink_devices::{args, Delivery, SessionRegistry};
use tokio::time::interval;
use tracing::info;

/// Drives a motor back and forth on the first discovered device.
///
/// Usage: `motor_client [DEVICE_PATH]`. Settings come from `motorlink.toml`
/// and `MOTORLINK__*` environment variables.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .with_config_file("motorlink.toml")
        .with_environment_prefix("motorlink")
        .build()
        .context("loading configuration")?;
    logging::init_from_config(&config.logging)?;

    let registry = SessionRegistry::from_config(&config)?;
    let device_path = std::env::args().nth(1);
    let session = registry
        .create(device_path.as_deref())
        .await
        .context("opening device session")?;
    info!("Session {} on {}", session.id(), session.identity());

    let mut ticker = interval(Duration::from_secs(1));
    let mut direction = 1.0_f32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let delivery = registry
                    .send("moveMotor", args![1, 0.5 * direction, -0.5 * direction])
                    .await?;
                if delivery == Delivery::Dropped {
                    info!("Device offline, command dropped");
                }
                direction = -direction;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Stats: {:?}", session.stats());
    registry.close_all().await?;
    Ok(())
}
