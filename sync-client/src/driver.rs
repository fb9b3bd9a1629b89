//! Background sync driver.
//!
//! One cooperative task decides when cycles run. It multiplexes:
//! - the periodic sync timer
//! - newly queued local work
//! - connectivity changes and change hints ([`Signal`])
//! - the backoff timer after a failed cycle
//! - shutdown
//!
//! While a retry is pending, timer ticks, queued work and hints do not start
//! cycles early; only the retry timer, an explicit [`Signal::SyncNow`] or a
//! reconnect do.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::{ClientError, SyncClient};
use crate::store::LocalStore;
use crate::transport::{Signal, Transport};

const SIGNAL_BUFFER: usize = 64;

/// Handle to a running driver task.
pub struct DriverHandle {
    signals: mpsc::Sender<Signal>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    /// Sender for connectivity changes, hints and sync requests.
    pub fn signals(&self) -> mpsc::Sender<Signal> {
        self.signals.clone()
    }

    /// Receiver that flips to true when the driver stops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask for a cycle now.
    pub async fn sync_now(&self) {
        let _ = self.signals.send(Signal::SyncNow).await;
    }

    /// Stop the driver and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Sync driver task failed: {}", e);
        }
    }
}

/// Spawn the driver for `client`.
pub fn spawn_driver<T, S>(client: Arc<SyncClient<T, S>>) -> DriverHandle
where
    T: Transport + 'static,
    S: LocalStore + 'static,
{
    let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run(client, signals_rx, shutdown_rx));

    DriverHandle {
        signals: signals_tx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn run<T, S>(
    client: Arc<SyncClient<T, S>>,
    mut signals: mpsc::Receiver<Signal>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: Transport + 'static,
    S: LocalStore + 'static,
{
    let period = client.config().sync_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut retry_at: Option<Instant> = None;

    tracing::debug!("Sync driver started (interval {:?})", period);

    loop {
        let waiting = retry_at.is_some();
        let run_now = tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => !waiting,
            _ = client.work_queued() => !waiting,
            _ = wait_until(retry_at) => {
                retry_at = None;
                client.retry_timer().await
            }
            signal = signals.recv() => match signal {
                None => break,
                Some(Signal::Online) => client.set_online(true).await,
                Some(Signal::Offline) => {
                    client.set_online(false).await;
                    retry_at = None;
                    false
                }
                Some(Signal::Hint(hint)) => client.note_hint(&hint).await && !waiting,
                Some(Signal::SyncNow) => true,
            },
        };

        if run_now {
            run_cycle(&client).await;
            retry_at = client.retry_after().await.map(|delay| Instant::now() + delay);
        }
    }

    tracing::debug!("Sync driver stopped");
}

async fn run_cycle<T: Transport, S: LocalStore>(client: &SyncClient<T, S>) {
    match client.sync().await {
        Ok(report) => tracing::debug!(
            "Cycle done: {} pushed, {} pulled, cursor {}",
            report.push.acked,
            report.pull.applied,
            report.pull.cursor
        ),
        Err(ClientError::Offline) | Err(ClientError::AuthPaused) => {}
        Err(e) => tracing::debug!("Cycle failed: {}", e),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
