use crate::config::Config;
use crate::server::engine::{DeviceSpec, Engine, EngineMsg, HwEvent};
use crate::server::ApiServer;
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;

pub async fn run_service(port_override: Option<u16>) -> Result<()> {
    info!("Starting sigbridge service");

    let mut config = Config::load()?;
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let (tx, rx) = mpsc::channel::<EngineMsg>(64);

    // All capture state lives on a dedicated dispatch thread; network tasks
    // and hardware clocks only post messages to it. The engine holds
    // thread-local state, so it is built on its own thread.
    let engine_tx = tx.clone();
    std::thread::Builder::new()
        .name("engine".to_string())
        .spawn(move || Engine::new(rx, engine_tx).run())
        .context("Failed to spawn engine thread")?;

    if config.demo.enabled {
        let settings = config.demo.settings(config.capture.sample_time);
        tx.send(EngineMsg::Hardware(HwEvent::Attach(DeviceSpec::Demo(
            settings,
        ))))
        .await
        .context("Engine thread rejected demo device")?;
        info!("Demo instrument attached (demo~{})", config.demo.serial);
    }

    info!("sigbridge is ready!");
    info!(
        "Connect a client: websocat ws://{}:{}/ws",
        config.server.bind, config.server.port
    );

    let api_server = ApiServer::new(tx, &config);
    api_server.start().await
}
