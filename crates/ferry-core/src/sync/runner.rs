//! Background sync task
//!
//! Drives a [`SyncEngine`] for the lifetime of the host process:
//! debounced flushes after local writes, a periodic pull, host commands
//! (manual flush, scheduler wake-ups, connectivity changes, bootstrap) and
//! backoff after rejected pushes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::{SyncEngine, SyncError};
use super::status::StatusUpdate;
use crate::config::Config;

/// Commands sent to the sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Push now, ignoring debounce and backoff
    FlushNow,
    /// Host background scheduler woke us; same as `FlushNow`
    BackgroundWake,
    /// Host connectivity event
    ConnectivityChanged(bool),
    /// Reset cursors and re-pull everything
    Bootstrap,
    /// Stop the task
    Shutdown,
}

/// Timing for the sync task
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Quiet period after a local write before flushing
    pub flush_debounce: Duration,
    /// Interval between pulls
    pub pull_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_millis(500),
            pull_interval: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            flush_debounce: Duration::from_millis(config.flush_debounce_ms),
            pull_interval: Duration::from_secs(config.pull_interval_secs.max(1)),
        }
    }
}

/// Handle to control the sync task
pub struct SyncHandle {
    /// Send commands to the sync task
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Watch engine status
    pub status_rx: watch::Receiver<StatusUpdate>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Send a command, returning false if the task has stopped
    pub async fn send(&self, command: SyncCommand) -> bool {
        self.command_tx.send(command).await.is_ok()
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Sync task ended abnormally: {}", e);
        }
    }
}

/// Spawn the sync task
///
/// Must be called from within a tokio runtime.
pub fn spawn_sync_task(engine: Arc<SyncEngine>, config: RunnerConfig) -> SyncHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let status_rx = engine.watch_status();

    let task = tokio::spawn(sync_task_loop(engine, config, command_rx));

    SyncHandle {
        command_tx,
        status_rx,
        task,
    }
}

async fn sync_task_loop(
    engine: Arc<SyncEngine>,
    config: RunnerConfig,
    mut command_rx: mpsc::Receiver<SyncCommand>,
) {
    let mut pull_timer = tokio::time::interval(config.pull_interval);
    pull_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Items left over from a previous run are flushed right away
    let mut flush_due = match engine.pending_count() {
        Ok(count) if count > 0 => Some(Instant::now()),
        _ => None,
    };

    info!("Sync task started");

    loop {
        let flush_at = flush_due;
        let flush_wait = async move {
            match flush_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(SyncCommand::FlushNow) | Some(SyncCommand::BackgroundWake) => {
                        flush_due = None;
                        flush(&engine, &config, &mut flush_due).await;
                    }
                    Some(SyncCommand::ConnectivityChanged(online)) => {
                        if engine.set_online(online) && online {
                            flush_due = None;
                            if let Err(e) = engine.sync().await {
                                log_failure("sync", &e);
                            }
                            reschedule(&engine, &config, &mut flush_due);
                        }
                    }
                    Some(SyncCommand::Bootstrap) => {
                        match engine.bootstrap().await {
                            Ok(report) => info!("Bootstrap pulled {} record(s)", report.applied),
                            Err(e) => log_failure("bootstrap", &e),
                        }
                    }
                }
            }
            _ = engine.flush_signal().notified() => {
                // Each write pushes the deadline back
                flush_due = Some(Instant::now() + config.flush_debounce);
            }
            _ = flush_wait => {
                flush_due = None;
                match engine.next_flush_delay() {
                    Ok(Some(delay)) if !delay.is_zero() => {
                        debug!("Backing off {:?} before next flush", delay);
                        flush_due = Some(Instant::now() + delay);
                    }
                    Ok(Some(_)) => flush(&engine, &config, &mut flush_due).await,
                    Ok(None) => {}
                    Err(e) => log_failure("flush", &e),
                }
            }
            _ = pull_timer.tick() => {
                if engine.is_online() {
                    if let Err(e) = engine.pull().await {
                        log_failure("pull", &e);
                    }
                } else {
                    match engine.check_reachable().await {
                        Ok(true) => {
                            info!("Remote reachable again");
                            flush_due = None;
                            if let Err(e) = engine.sync().await {
                                log_failure("sync", &e);
                            }
                            reschedule(&engine, &config, &mut flush_due);
                        }
                        Ok(false) => {}
                        Err(e) => log_failure("reachability check", &e),
                    }
                }
            }
        }
    }

    info!("Sync task stopped");
}

async fn flush(engine: &SyncEngine, config: &RunnerConfig, flush_due: &mut Option<Instant>) {
    if !engine.is_online() {
        return;
    }
    match engine.flush().await {
        Ok(report) => debug!("Flush pushed {} item(s)", report.pushed),
        Err(e) => log_failure("flush", &e),
    }
    reschedule(engine, config, flush_due);
}

/// Schedule another flush while pending items remain
fn reschedule(engine: &SyncEngine, config: &RunnerConfig, flush_due: &mut Option<Instant>) {
    if !engine.is_online() {
        return;
    }
    match engine.next_flush_delay() {
        Ok(Some(delay)) => *flush_due = Some(Instant::now() + delay.max(config.flush_debounce)),
        Ok(None) => {}
        Err(e) => log_failure("flush", &e),
    }
}

fn log_failure(operation: &str, error: &SyncError) {
    match error {
        SyncError::Busy | SyncError::Offline => debug!("Skipped {}: {}", operation, error),
        _ => warn!("{} failed: {}", operation, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QueueAction, Record, Table};
    use crate::storage::LocalStore;
    use crate::sync::engine::EngineConfig;
    use crate::sync::status::SyncState;
    use crate::sync::testing::MockRemote;
    use serde_json::json;

    fn runner_config() -> RunnerConfig {
        RunnerConfig {
            flush_debounce: Duration::from_millis(50),
            pull_interval: Duration::from_secs(3600),
        }
    }

    fn setup(online: bool) -> (Arc<SyncEngine>, Arc<MockRemote>) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let remote = Arc::new(MockRemote::new());
        let engine = Arc::new(SyncEngine::new(
            store,
            remote.clone(),
            "device-a",
            EngineConfig::default(),
            online,
        ));
        (engine, remote)
    }

    fn patient(id: &str) -> Record {
        Record::from_json(json!({"id": id, "email": format!("{id}@example.com")})).unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.flush_debounce, Duration::from_millis(500));
        assert_eq!(config.pull_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_burst_of_writes_is_flushed_once() {
        let (engine, remote) = setup(true);
        let handle = spawn_sync_task(Arc::clone(&engine), runner_config());

        for i in 0..3 {
            engine
                .enqueue(Table::Patients, patient(&format!("p-{i}")), QueueAction::Create)
                .unwrap();
        }

        assert!(wait_for(|| engine.pending_count().unwrap() == 0).await);
        let pushed = remote.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].items.len(), 3);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_flushes_and_pulls() {
        let (engine, remote) = setup(false);
        engine
            .enqueue(Table::Patients, patient("p-1"), QueueAction::Create)
            .unwrap();
        let handle = spawn_sync_task(Arc::clone(&engine), runner_config());

        assert!(handle.send(SyncCommand::ConnectivityChanged(true)).await);

        assert!(wait_for(|| engine.pending_count().unwrap() == 0).await);
        assert!(wait_for(|| !remote.pulls().is_empty()).await);
        assert_eq!(remote.pushed().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovers_from_network_blip_without_host_event() {
        let (engine, remote) = setup(true);
        remote.set_reachable(false);
        let handle = spawn_sync_task(
            Arc::clone(&engine),
            RunnerConfig {
                flush_debounce: Duration::from_millis(20),
                pull_interval: Duration::from_millis(50),
            },
        );
        engine
            .enqueue(Table::Patients, patient("p-1"), QueueAction::Create)
            .unwrap();

        assert!(wait_for(|| !engine.is_online()).await);
        assert_eq!(engine.pending_count().unwrap(), 1);

        remote.set_reachable(true);

        assert!(wait_for(|| engine.pending_count().unwrap() == 0).await);
        assert!(engine.is_online());
        assert_eq!(remote.pushed().len(), 1);
        assert!(!remote.pulls().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_wake_flushes() {
        let (engine, remote) = setup(true);
        let handle = spawn_sync_task(
            Arc::clone(&engine),
            RunnerConfig {
                flush_debounce: Duration::from_secs(3600),
                ..runner_config()
            },
        );
        engine
            .enqueue(Table::Patients, patient("p-1"), QueueAction::Create)
            .unwrap();

        assert!(handle.send(SyncCommand::BackgroundWake).await);

        assert!(wait_for(|| remote.pushed().len() == 1).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_connectivity_lost_is_reported() {
        let (engine, _remote) = setup(true);
        let handle = spawn_sync_task(Arc::clone(&engine), runner_config());
        let status_rx = handle.status_rx.clone();

        assert!(handle.send(SyncCommand::ConnectivityChanged(false)).await);

        assert!(wait_for(|| status_rx.borrow().state == SyncState::Offline).await);
        handle.shutdown().await;
    }
}
