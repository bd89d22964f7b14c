use std::time::Duration;

use log::info;

use modbus_tcp_master::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5020".to_string());
    let server = EmulatedServer::bind(addr.as_str()).await?;

    server.with_unit(1, |tables| {
        tables.holding_registers[0] = 230;
        tables.discrete_inputs[0] = true;
    });

    info!("Serving Modbus TCP on {}", server.local_addr());

    // A slowly rising input register gives pollers something to watch.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => server.with_unit(1, |tables| {
                tables.input_registers[0] = tables.input_registers[0].wrapping_add(1);
            }),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Served {} request(s)", server.requests_seen());
    server.shutdown();
    Ok(())
}
