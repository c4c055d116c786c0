//! Keepalive, dead peer detection and task supervision
//!
//! Every long-running duty of a session runs as its own task in a
//! [`Supervisor`]. A task that fails is mapped to a [`CloseReason`] and closes
//! the session; the unreliable channel is the exception and never does.

use crate::cstp::TunnelError;
use crate::cstp::packet::TunnelPacket;
use crate::cstp::session::{CloseReason, Session};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Reliable,
    Unreliable,
    DeviceReader,
    DeviceWriter,
    Keepalive,
    DeadPeer,
}

impl TaskKind {
    /// Close reason for a failed task, `None` when the failure is not fatal
    pub fn failure_reason(self, error: &TunnelError) -> Option<CloseReason> {
        match self {
            TaskKind::Reliable => match error {
                TunnelError::Disconnected => Some(CloseReason::ServerDisconnect),
                _ => Some(CloseReason::ReliableFailed),
            },
            TaskKind::Unreliable => None,
            TaskKind::DeviceReader | TaskKind::DeviceWriter => Some(CloseReason::DeviceFailed),
            TaskKind::Keepalive => Some(CloseReason::KeepaliveFailed),
            TaskKind::DeadPeer => Some(CloseReason::LivenessTimeout),
        }
    }
}

type TaskOutcome = (TaskKind, Result<(), TunnelError>);

/// Owns the session's tasks
pub struct Supervisor {
    session: Arc<Session>,
    tasks: JoinSet<TaskOutcome>,
}

impl Supervisor {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, kind: TaskKind, task: F)
    where
        F: Future<Output = Result<(), TunnelError>> + Send + 'static,
    {
        debug!("Starting {:?} task", kind);
        self.tasks.spawn(async move { (kind, task.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait until the session starts closing, closing it ourselves when a
    /// task fails fatally.
    pub async fn watch(&mut self) {
        let cancel = self.session.cancel_token();
        loop {
            let joined = tokio::select! {
                _ = cancel.cancelled() => return,
                joined = self.tasks.join_next() => joined,
            };
            match joined {
                Some(Ok((kind, result))) => self.record(kind, result),
                Some(Err(e)) => {
                    error!("Session task panicked: {}", e);
                    self.session.close(CloseReason::ReliableFailed);
                }
                None => {
                    warn!("All session tasks ended");
                    self.session.close(CloseReason::ReliableFailed);
                    return;
                }
            }
        }
    }

    fn record(&self, kind: TaskKind, result: Result<(), TunnelError>) {
        let Err(e) = result else {
            debug!("{:?} task finished", kind);
            return;
        };
        match kind.failure_reason(&e) {
            Some(reason) => {
                if !self.session.is_closing() {
                    error!("{:?} task failed: {}", kind, e);
                }
                self.session.close(reason);
            }
            None => warn!("{:?} task failed: {}", kind, e),
        }
    }

    /// Give tasks `grace` to finish after cancellation, then abort the rest.
    pub async fn shutdown(mut self, grace: Duration) {
        if timeout(grace, drain(&mut self.tasks)).await.is_err() {
            warn!("Session tasks still running after {:?}, aborting", grace);
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
    }
}

async fn drain(tasks: &mut JoinSet<TaskOutcome>) {
    while let Some(joined) = tasks.join_next().await {
        if let Ok((kind, Err(e))) = joined {
            debug!("{:?} task ended during shutdown: {}", kind, e);
        }
    }
}

/// Queue a keepalive on the reliable channel every `period`.
///
/// A full queue skips the tick since traffic is already flowing; a closed
/// queue means the reliable channel is gone and fails the task.
pub async fn keepalive_timer(
    session: Arc<Session>,
    reliable: mpsc::Sender<TunnelPacket>,
    period: Duration,
) -> Result<(), TunnelError> {
    let cancel = session.cancel_token();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        match reliable.try_send(TunnelPacket::keepalive()) {
            Ok(()) => debug!("Queued keepalive"),
            Err(TrySendError::Full(_)) => debug!("TLS queue busy, skipping keepalive"),
            Err(TrySendError::Closed(_)) => return Err(TunnelError::KeepaliveFailed),
        }
    }
}

/// Fail once no frame has arrived on either channel for `deadline`.
pub async fn dead_peer_watchdog(session: Arc<Session>, deadline: Duration) -> Result<(), TunnelError> {
    let cancel = session.cancel_token();
    loop {
        let expires = session.last_activity() + deadline;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep_until(expires) => {}
        }
        if session.last_activity() + deadline <= Instant::now() {
            warn!("No traffic from server for {:?}", deadline);
            return Err(TunnelError::LivenessTimeout(deadline));
        }
    }
}
