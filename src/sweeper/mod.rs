//! Periodic liveness tasks
//!
//! Each sweeper is an independent interval loop over the registry. They only
//! go through registry operations, so they are safe to run while sessions
//! are being mutated by sockets and pumps.

use crate::config::SweeperConfig;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub struct Sweepers {
    handles: Vec<JoinHandle<()>>,
}

impl Sweepers {
    /// Start the idle, flush and stuck sweepers
    pub fn start(registry: Arc<SessionRegistry>, config: &SweeperConfig) -> Self {
        let handles = vec![
            spawn_idle_sweeper(
                registry.clone(),
                Duration::from_secs(config.idle_interval.max(1)),
                Duration::from_secs(config.idle_timeout),
                config.hard_delete_idle,
            ),
            spawn_flush_sweeper(
                registry.clone(),
                Duration::from_secs(config.flush_interval.max(1)),
            ),
            spawn_stuck_detector(
                registry,
                Duration::from_secs(config.stuck_interval.max(1)),
                Duration::from_secs(config.stuck_threshold),
            ),
        ];
        tracing::info!(
            "Sweepers started (idle timeout {}s, flush every {}s, stuck after {}s)",
            config.idle_timeout,
            config.flush_interval,
            config.stuck_threshold
        );
        Self { handles }
    }

    pub fn stop(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

pub fn spawn_idle_sweeper(
    registry: Arc<SessionRegistry>,
    every: Duration,
    timeout: Duration,
    hard_delete: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = registry.sweep_idle(timeout, hard_delete).await;
            if !swept.is_empty() {
                tracing::info!("[Sweeper] Removed {} idle sessions", swept.len());
            }
        }
    })
}

pub fn spawn_flush_sweeper(registry: Arc<SessionRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            registry.flush_dirty().await;
        }
    })
}

pub fn spawn_stuck_detector(
    registry: Arc<SessionRegistry>,
    every: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            registry.detect_stuck(threshold).await;
        }
    })
}
