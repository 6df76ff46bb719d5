//! Sync triggers.
//!
//! The scheduler owns a background task that turns timer ticks, network
//! reconnects, foreground events and explicit requests into
//! [`SyncEngine::perform_sync`] calls. Overlapping triggers are collapsed
//! by the engine itself, so the scheduler never waits for a run before
//! accepting the next trigger.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = Scheduler::new(engine.clone()).spawn();
//! handle.trigger(SyncTrigger::Foreground);
//! handle.shutdown().await;
//! ```

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::network::NetworkStatus;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The sync interval elapsed.
    Periodic,
    /// Connectivity came back.
    NetworkReconnect,
    /// The app returned to the foreground.
    Foreground,
    /// The user asked for it.
    User,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::NetworkReconnect => "network_reconnect",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::User => "user",
        })
    }
}

/// Builds the trigger loop for one engine.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    run_on_start: bool,
}

impl Scheduler {
    /// Creates a scheduler for `engine`.
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            run_on_start: false,
        }
    }

    /// Starts a run as soon as the loop is spawned.
    pub fn with_run_on_start(mut self, run: bool) -> Self {
        self.run_on_start = run;
        self
    }

    /// Spawns the trigger loop on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let watches = Watches {
            network: self.engine.context().network.subscribe(),
            config: self.engine.context().config.subscribe(),
        };
        let task = tokio::spawn(trigger_loop(
            self.engine.clone(),
            watches,
            rx,
            shutdown.clone(),
            self.run_on_start,
        ));
        SchedulerHandle {
            engine: self.engine,
            triggers: tx,
            shutdown,
            task,
        }
    }
}

/// Controls a spawned scheduler.
pub struct SchedulerHandle {
    engine: Arc<SyncEngine>,
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Requests a run. Returns false once the scheduler has stopped.
    ///
    /// A full trigger queue counts as accepted; a run is already due.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        match self.triggers.try_send(trigger) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// The engine driven by this scheduler.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Stops the loop, cancels the run in progress and waits for it.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.engine.cancel();
        let _ = self.task.await;
    }
}

struct Watches {
    network: watch::Receiver<NetworkStatus>,
    config: watch::Receiver<SyncConfig>,
}

async fn trigger_loop(
    engine: Arc<SyncEngine>,
    watches: Watches,
    mut triggers: mpsc::Receiver<SyncTrigger>,
    shutdown: CancellationToken,
    run_on_start: bool,
) {
    let Watches {
        mut network,
        mut config,
    } = watches;
    let mut online = network.borrow_and_update().allows_sync(false);
    let mut period = config.borrow_and_update().sync_interval;
    let mut ticker = periodic(period);
    let mut runs: JoinSet<()> = JoinSet::new();

    if run_on_start {
        start_run(&engine, &mut runs, SyncTrigger::Foreground);
    }
    info!(interval_secs = period.as_secs(), "sync scheduler started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                start_run(&engine, &mut runs, SyncTrigger::Periodic);
            }
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_online = network.borrow_and_update().allows_sync(false);
                if now_online && !online {
                    start_run(&engine, &mut runs, SyncTrigger::NetworkReconnect);
                }
                online = now_online;
            }
            changed = config.changed() => {
                if changed.is_err() {
                    break;
                }
                let interval = config.borrow_and_update().sync_interval;
                if interval != period {
                    debug!(interval_secs = interval.as_secs(), "sync interval changed");
                    period = interval;
                    ticker = periodic(period);
                }
            }
            Some(trigger) = triggers.recv() => {
                start_run(&engine, &mut runs, trigger);
            }
            Some(_) = runs.join_next(), if !runs.is_empty() => {}
        }
    }

    engine.cancel();
    while runs.join_next().await.is_some() {}
    info!("sync scheduler stopped");
}

fn start_run(engine: &Arc<SyncEngine>, runs: &mut JoinSet<()>, trigger: SyncTrigger) {
    debug!(%trigger, "sync triggered");
    let engine = engine.clone();
    runs.spawn(async move {
        engine.perform_sync().await;
    });
}

/// Ticks every `period`, first after one full period.
fn periodic(period: Duration) -> time::Interval {
    let period = period.max(Duration::from_secs(1));
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthToken, StaticAuth};
    use crate::clock::SystemClock;
    use crate::config::ConfigHandle;
    use crate::engine::SyncContext;
    use crate::ledger::Ledger;
    use crate::network::NetworkMonitor;
    use crate::route::LocalOnlyRoute;
    use crate::store::MemoryLocalStore;

    fn engine(network: NetworkStatus, interval: Duration) -> Arc<SyncEngine> {
        let ctx = SyncContext::new(
            Ledger::in_memory().unwrap().into_shared(),
            Arc::new(MemoryLocalStore::new()),
            vec![Arc::new(LocalOnlyRoute::new())],
            Arc::new(StaticAuth::new(Some(AuthToken::new("t")))),
            NetworkMonitor::new(network),
            ConfigHandle::new(SyncConfig::new().with_sync_interval(interval)),
            Arc::new(SystemClock),
        );
        Arc::new(SyncEngine::new(ctx).unwrap())
    }

    async fn wait_for_runs(engine: &SyncEngine, runs: u64) {
        for _ in 0..200 {
            if engine.stats().runs >= runs {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {runs} runs, saw {}", engine.stats().runs);
    }

    #[tokio::test]
    async fn manual_trigger_runs_engine() {
        let engine = engine(NetworkStatus::Wifi, Duration::from_secs(3600));
        let handle = Scheduler::new(engine.clone()).spawn();

        assert!(handle.trigger(SyncTrigger::User));
        wait_for_runs(&engine, 1).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_triggers_run() {
        let engine = engine(NetworkStatus::Offline, Duration::from_secs(3600));
        let handle = Scheduler::new(engine.clone()).spawn();

        engine.context().network.set(NetworkStatus::Cellular);
        wait_for_runs(&engine, 1).await;
        assert_eq!(engine.stats().completed_runs, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_each_interval() {
        let engine = engine(NetworkStatus::Wifi, Duration::from_secs(60));
        let handle = Scheduler::new(engine.clone()).spawn();

        tokio::time::sleep(Duration::from_secs(61)).await;
        wait_for_runs(&engine, 1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        wait_for_runs(&engine, 2).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_after_shutdown_is_refused() {
        let engine = engine(NetworkStatus::Wifi, Duration::from_secs(3600));
        let handle = Scheduler::new(engine.clone()).spawn();
        let sender = handle.triggers.clone();
        handle.shutdown().await;
        assert!(sender.try_send(SyncTrigger::User).is_err());
    }
}
