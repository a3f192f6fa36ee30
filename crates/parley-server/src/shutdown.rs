//! Shutdown sequencing for the server and the broker behind it.
//!
//! Cancelling the coordinator's token stops the listener and the broker's
//! background loops. [`ShutdownCoordinator::close_broker`] closes every
//! session with reason `shutdown` exactly once, and
//! [`ShutdownCoordinator::drain`] then waits, bounded by the drain timeout,
//! for the background loops and every broker task to exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parley_broker::Broker;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long [`ShutdownCoordinator::drain`] waits before aborting.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Sessions closed by this drain (zero if the broker was already closed).
    pub sessions_closed: usize,
    /// Whether the deadline passed and remaining tasks were aborted.
    pub timed_out: bool,
}

/// Owns the server's cancellation token and the broker drain.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    broker_closed: AtomicBool,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator with the default drain timeout.
    pub fn new() -> Self {
        Self::with_drain_timeout(DEFAULT_DRAIN_TIMEOUT)
    }

    /// Coordinator that gives up on stragglers after `drain_timeout`.
    pub fn with_drain_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            broker_closed: AtomicBool::new(false),
            drain_timeout,
        }
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every session and interaction on `broker` and stop its
    /// per-message tasks. Only the first call does anything; it returns the
    /// number of sessions closed.
    pub fn close_broker(&self, broker: &Broker) -> usize {
        if self.broker_closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        broker.shutdown()
    }

    /// Cancel, close the broker, then wait for `background` and the broker's
    /// own tasks. Anything still running at the deadline is aborted.
    pub async fn drain(&self, broker: &Arc<Broker>, background: Vec<JoinHandle<()>>) -> DrainReport {
        self.shutdown();
        let sessions_closed = self.close_broker(broker);
        info!(
            sessions_closed,
            background = background.len(),
            timeout_secs = self.drain_timeout.as_secs(),
            "draining broker"
        );

        let aborts: Vec<_> = background.iter().map(JoinHandle::abort_handle).collect();
        let idle = async {
            let _ = futures::future::join_all(background).await;
            broker.wait_idle().await;
        };
        let timed_out = tokio::time::timeout(self.drain_timeout, idle).await.is_err();
        if timed_out {
            warn!(timeout = ?self.drain_timeout, "broker drain timed out, aborting background loops");
            for abort in aborts {
                abort.abort();
            }
        }
        DrainReport {
            sessions_closed,
            timed_out,
        }
    }

    /// Begin shutdown and wait for `handles` (typically the server task)
    /// within the drain timeout. Returns `false` if any had to be aborted.
    pub async fn join(&self, handles: Vec<JoinHandle<()>>) -> bool {
        self.shutdown();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(self.drain_timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if !joined {
            warn!(timeout = ?self.drain_timeout, "server did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        joined
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("shutting_down", &self.is_shutting_down())
            .field("broker_closed", &self.broker_closed.load(Ordering::Relaxed))
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}
