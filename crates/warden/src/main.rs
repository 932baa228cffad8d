use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use warden_core::{
    access::{AccessGate, GateDeps},
    config::Config,
    ports::ChannelSink,
    scheduler::MaintenanceScheduler,
};
use warden_telegram::health::LinkHealth;

#[tokio::main]
async fn main() -> Result<(), warden_core::Error> {
    warden_core::logging::init("warden")?;

    let cfg = Arc::new(Config::load()?);

    let (sink, events) = ChannelSink::new();
    let health = Arc::new(LinkHealth::default());
    let gate = Arc::new(AccessGate::open(
        &cfg,
        GateDeps {
            events: Arc::new(sink),
            probe: Some(health.clone()),
            ..GateDeps::default()
        },
    ));

    let scheduler = MaintenanceScheduler::start(
        gate.clone(),
        cfg.maintenance_interval,
        cfg.expiry_sweep_interval,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, shutting down");
                on_signal.cancel();
            }
            Err(e) => tracing::warn!("cannot listen for ctrl-c: {e}"),
        }
    });

    let polled =
        warden_telegram::router::run_polling(cfg, gate.clone(), events, health, cancel.clone())
            .await;

    // Sweeps must be gone before the last write.
    cancel.cancel();
    scheduler.shutdown().await;
    if let Err(e) = gate.flush().await {
        tracing::error!("final flush failed: {e}");
    }

    polled.map_err(|e| warden_core::Error::External(format!("telegram bot failed: {e}")))
}
