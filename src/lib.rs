pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod omnik;
pub mod options;
pub mod prelude;
pub mod scheduler;
pub mod utils;

pub use error::{Error, Result};

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use std::io::Write;
use std::time::Duration;

/// Running pieces of the daemon, in the order they are stopped.
#[derive(Clone)]
pub struct Components {
    pub coordinator: Coordinator,
    pub scheduler: Scheduler,
    pub channels: Channels,
}

impl Components {
    /// Shutdown order:
    /// 1. Scheduler, so no new pull sessions start
    /// 2. Listeners, draining every connected client
    /// 3. Coordinator event pump
    pub async fn stop(&self) {
        info!("Stopping all components...");

        self.scheduler.stop();
        self.coordinator.stop_listeners().await;
        self.coordinator.stop();

        info!("Shutdown complete");
    }
}

fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

/// Logs every engine event until the coordinator shuts down.
async fn event_logger(mut receiver: broadcast::Receiver<Event>) {
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("event logger lagging, {} events skipped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            Event::ListenerReady(info) => info!("listener {} ready", info),
            Event::ClientConnected(handle) => info!("client {} connected", handle),
            Event::ClientDisconnected { remote, listener } => {
                info!("client {} disconnected from {}", remote, listener)
            }
            Event::PushDataReceived(data, handle) => {
                debug!("{} bytes pushed by {}", data.len(), handle)
            }
            Event::PullDataReceived(data, session) => {
                debug!("{} bytes pulled from {}", data.len(), session)
            }
            Event::StatisticsAvailable(statistics) => info!("statistics: {}", statistics.to_json()),
            Event::PullSessionFailed { session, reason } => {
                warn!("pull from {} failed: {}", session, reason)
            }
            Event::BindFailed { name, port } => error!("listener {} could not bind port {}", name, port),
            Event::Shutdown => break,
        }
    }
}

/// Daemon entry point: load config, start everything, wait for Ctrl+C or
/// the runtime limit, then shut down in order.
pub async fn app() -> anyhow::Result<()> {
    let options = Options::new();

    // the log level lives in the config file, so the logger can only be
    // set up once that has been read
    let config = match Config::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info");
            return Err(e);
        }
    };
    init_logging(config.loglevel());

    info!(
        "omnik-bridge {} starting with config file: {}",
        CARGO_PKG_VERSION, options.config_file
    );
    config.print_summary();

    let channels = Channels::new();

    info!("  Creating Coordinator...");
    let coordinator = Coordinator::new(channels.clone(), config.coordinator_options())
        .with_logger(Logger::log_crate("omnik_bridge::engine"));

    let event_logger_handle = tokio::spawn(event_logger(channels.subscribe()));

    let coordinator_clone = coordinator.clone();
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator_clone.start().await {
            error!("Coordinator task failed: {}", e);
        }
    });

    info!("  Starting listeners...");
    let listeners: Vec<_> = config
        .enabled_listeners()
        .into_iter()
        .map(|l| (l.name, l.port))
        .collect();
    if let Err(e) = coordinator.start_listeners(listeners).await {
        error!("Failed to start listeners: {}", e);
    }

    info!("  Creating Scheduler...");
    let scheduler = Scheduler::new(config.enabled_pull_targets(), coordinator.clone());
    let scheduler_clone = scheduler.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler_clone.start().await {
            error!("Scheduler task failed: {}", e);
        }
    });

    let components = Components {
        coordinator: coordinator.clone(),
        scheduler,
        channels,
    };

    info!("Waiting for shutdown signal...");
    match options.runtime {
        Some(secs) => {
            tokio::select! {
                r = tokio::signal::ctrl_c() => r?,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Runtime limit of {}s reached", secs);
                }
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutdown signal received, stopping components...");
    components.stop().await;

    if let Err(e) = coordinator_handle.await {
        error!("Error waiting for coordinator task: {}", e);
    }
    if let Err(e) = scheduler_handle.await {
        error!("Error waiting for scheduler task: {}", e);
    }
    if let Err(e) = event_logger_handle.await {
        error!("Error waiting for event logger task: {}", e);
    }

    info!("Final statistics:");
    coordinator.print_summary();

    Ok(())
}
