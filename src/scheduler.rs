use crate::config::PullTarget;
use crate::coordinator::Coordinator;

use log::{debug, info};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Pulls every enabled target right away, then once per its interval.
#[derive(Clone)]
pub struct Scheduler {
    targets: Vec<PullTarget>,
    coordinator: Coordinator,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(targets: Vec<PullTarget>, coordinator: Coordinator) -> Self {
        Self {
            targets: targets.into_iter().filter(|t| t.enabled()).collect(),
            coordinator,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        if self.targets.is_empty() {
            debug!("no enabled pull targets, scheduler idle");
            return Ok(());
        }

        let tasks: Vec<_> = self
            .targets
            .iter()
            .cloned()
            .map(|target| {
                let coordinator = self.coordinator.clone();
                let shutdown = self.shutdown.clone();
                Self::run_target(target, coordinator, shutdown)
            })
            .collect();

        futures::future::join_all(tasks).await;

        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn run_target(target: PullTarget, coordinator: Coordinator, shutdown: CancellationToken) {
        info!(
            "pulling {}:{} every {}s",
            target.address(),
            target.port(),
            target.interval().as_secs()
        );

        // first tick completes immediately
        let mut interval = tokio::time::interval(target.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let session = coordinator.pull_data(target.address(), target.port(), target.serial());
                    debug!("started pull session {} to {}", session.id, session);
                }
            }
        }
    }
}
