use crate::api::ConnectionsBackend;
use crate::error::ConnectError;
use crate::types::{ChannelResult, ConnectionRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Floor for the poll and closed-window intervals. A zero period would make
/// `tokio::time::interval` panic.
pub(crate) const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Polls the connection list until the requested pair shows up as
/// connected. Never writes to the backend.
pub struct StatusPoller {
    backend: Arc<dyn ConnectionsBackend>,
    request: ConnectionRequest,
    interval: Duration,
    deadline: Instant,
    timeout: Duration,
}

pub struct PollerHandle {
    results: mpsc::Receiver<ChannelResult>,
    final_check: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusPoller {
    pub fn new(
        backend: Arc<dyn ConnectionsBackend>,
        request: ConnectionRequest,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            request,
            interval: interval.max(MIN_INTERVAL),
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// Shares the attempt's deadline instead of computing a fresh one.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn spawn(self) -> PollerHandle {
        let (tx, results) = mpsc::channel(1);
        let final_check = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(tx, final_check.clone(), cancel.clone()));
        PollerHandle {
            results,
            final_check,
            cancel,
            task,
        }
    }

    async fn run(
        self,
        tx: mpsc::Sender<ChannelResult>,
        final_check: Arc<Notify>,
        cancel: CancellationToken,
    ) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = time::sleep_until(self.deadline);
        tokio::pin!(deadline);
        let mut consecutive_errors = 0u32;

        loop {
            let is_final = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut deadline => {
                    info!(request = %self.request, "Status poll gave up at deadline");
                    let _ = tx
                        .send(ChannelResult::Failure(ConnectError::Timeout(self.timeout)))
                        .await;
                    return;
                }
                _ = final_check.notified() => true,
                _ = ticker.tick() => false,
            };

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                polled = self.backend.list_connections() => polled,
            };

            match polled {
                Ok(connections) => {
                    consecutive_errors = 0;
                    if let Some(found) = connections.iter().find(|c| c.matches(&self.request)) {
                        info!(request = %self.request, "Status poll found connection");
                        let _ = tx
                            .send(ChannelResult::Success {
                                email: found.user_email.clone(),
                            })
                            .await;
                        return;
                    }
                    debug!(request = %self.request, is_final, "Not connected yet");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        request = %self.request,
                        consecutive_errors,
                        "Status poll failed, retrying: {}",
                        e
                    );
                }
            }

            if is_final {
                let _ = tx.send(ChannelResult::Failure(ConnectError::WindowClosed)).await;
                return;
            }
        }
    }
}

impl PollerHandle {
    /// Resolves once with the poller's verdict. Cancel-safe; stays pending
    /// after the poller has been stopped.
    pub async fn settled(&mut self) -> ChannelResult {
        match self.results.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    /// Polls once right away and settles with `WindowClosed` if the pair is
    /// still not connected.
    pub fn request_final_check(&self) {
        self.final_check.notify_one();
    }

    /// Idempotent.
    pub fn stop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("Stopping status poller");
        }
        self.cancel.cancel();
        self.task.abort();
        self.results.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
