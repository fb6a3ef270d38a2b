use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plc_bridge::config::Config;
use plc_bridge::forward::ForwardWorker;
use plc_bridge::ingest::IngestWorker;
use plc_bridge::republish::RepublishWorker;
use plc_bridge::server::WsVariableServer;
use plc_bridge::shutdown::{ShutdownCoordinator, WorkerExit};
use plc_bridge::snapshot::SharedSnapshot;
use plc_bridge::source::SimulationSource;
use plc_bridge::ws_client::WsSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate()?;
    let upstream = if config.simulate {
        "simulation"
    } else {
        config.upstream_url.as_str()
    };
    tracing::info!(
        upstream,
        server = %config.server_endpoint,
        forward = %config.forward_destination(),
        "starting bridge"
    );

    let snapshot = Arc::new(SharedSnapshot::new());
    let coordinator = ShutdownCoordinator::new();
    let paths = config.ingest_paths()?;

    // one producer, two consumers, all sharing the snapshot
    if config.simulate {
        let worker = IngestWorker::new(
            SimulationSource::new(),
            paths,
            Arc::clone(&snapshot),
            config.ingest_interval(),
            config.connect_timeout(),
        );
        coordinator.spawn("ingest", worker.run(coordinator.token()));
    } else {
        let worker = IngestWorker::new(
            WsSource::new(config.upstream_url.clone()),
            paths,
            Arc::clone(&snapshot),
            config.ingest_interval(),
            config.connect_timeout(),
        );
        coordinator.spawn("ingest", worker.run(coordinator.token()));
    }

    let republish = RepublishWorker::new(
        WsVariableServer::new(),
        config.republish_settings(),
        Arc::clone(&snapshot),
    );
    coordinator.spawn("republish", republish.run(coordinator.token()));

    let forward = ForwardWorker::new(
        config.forward_destination(),
        Arc::clone(&snapshot),
        config.forward_interval(),
    );
    coordinator.spawn("forward", forward.run(coordinator.token()));

    tracing::info!("Press Ctrl+C to shutdown");
    coordinator.listen_for_signals().await;

    let report = coordinator.join(config.shutdown_timeout()).await;
    for (name, exit) in &report.exits {
        match exit {
            WorkerExit::Cancelled => tracing::debug!(worker = *name, "joined"),
            WorkerExit::Failed(e) => tracing::info!(worker = *name, error = %e, "joined after failure"),
        }
    }
    if !report.timed_out.is_empty() {
        tracing::warn!(workers = ?report.timed_out, "workers aborted at shutdown");
    }

    let last = snapshot.sample();
    tracing::info!(counter = last.counter, random = last.random, derived = last.derived, "last snapshot");
    Ok(())
}
