use std::time::Duration;

use log::{error, info};

use modbus_tcp_master::prelude::*;

/// Loads a JSON configuration and polls every configured device.
///
/// `cargo run --example poll -- modbus.json`
#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "modbus.json".to_string());
    let config = Config::load(&path)?;

    let mut controllers = ModbusController::from_config(config)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        for controller in &controllers {
            for (device, err) in controller.update_all().await {
                error!("`{device}` failed to update: {err}");
            }

            for device in controller.devices() {
                for block in device.blocks() {
                    info!(
                        "{}/{}: {:?}",
                        device.name(),
                        block.name,
                        device.block(&block.name)
                    );
                }
            }
        }
    }

    controllers.iter_mut().for_each(ModbusController::close);
    Ok(())
}
