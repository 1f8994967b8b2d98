//! Coordinated shutdown of the preparer's watch loops.
//!
//! ```text
//!   Running --signal--> Stopping --pods quiesced, hooks quiesced or grace over--> Stopped
//! ```
//!
//! On the first termination signal the hook loop is cancelled, then the pod
//! loop. The coordinator waits for the pod loop to acknowledge without a time
//! limit, since it may be in the middle of writing reality; the hook loop only
//! gets `hook_grace`. Signals that arrive while stopping are ignored.

use std::{fmt, io, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Stopped,
}

/// Sent by a loop once its last store call and action have finished.
#[derive(Debug)]
pub struct Quiesced;

/// The loop's side of a [`loop_channel`].
pub struct LoopControl {
    name: &'static str,
    cancel: CancellationToken,
    ack: oneshot::Sender<Quiesced>,
}

impl LoopControl {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Tell the coordinator this loop is done. Dropping the control without
    /// calling this is reported as an abandoned loop.
    pub fn quiesce(self) {
        debug!(task = self.name, "loop quiesced");
        // the coordinator may already have given up waiting
        let _ = self.ack.send(Quiesced);
    }
}

/// The coordinator's side of a [`loop_channel`].
pub struct LoopHandle {
    name: &'static str,
    cancel: CancellationToken,
    ack: oneshot::Receiver<Quiesced>,
}

impl LoopHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub fn loop_channel(name: &'static str) -> (LoopControl, LoopHandle) {
    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();
    (
        LoopControl {
            name,
            cancel: cancel.clone(),
            ack: tx,
        },
        LoopHandle {
            name,
            cancel,
            ack: rx,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Quiesced,
    /// The loop went away without acknowledging (panicked or dropped its control).
    Abandoned,
    TimedOut,
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AckStatus::Quiesced => "quiesced",
            AckStatus::Abandoned => "abandoned",
            AckStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub signal: String,
    pub pods: AckStatus,
    pub hooks: AckStatus,
    pub ignored_signals: usize,
}

/// Where termination requests come from.
#[async_trait]
pub trait SignalSource: Send {
    /// The next signal's name, or `None` if no more can arrive.
    async fn recv(&mut self) -> Option<String>;
}

/// SIGTERM and SIGINT.
pub struct TerminationSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(TerminationSignals {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }
}

#[async_trait]
impl SignalSource for TerminationSignals {
    async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            s = self.term.recv() => s.map(|_| "SIGTERM".to_string()),
            s = self.int.recv() => s.map(|_| "SIGINT".to_string()),
        }
    }
}

#[async_trait]
impl SignalSource for mpsc::Receiver<String> {
    async fn recv(&mut self) -> Option<String> {
        mpsc::Receiver::recv(self).await
    }
}

pub struct ShutdownCoordinator {
    state: watch::Sender<ShutdownState>,
    pods: LoopHandle,
    hooks: LoopHandle,
    hook_grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(pods: LoopHandle, hooks: LoopHandle, hook_grace: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        ShutdownCoordinator {
            state,
            pods,
            hooks,
            hook_grace,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Wait for the first signal, then stop both loops. Signals arriving
    /// before the loops have stopped are logged and ignored. A closed signal
    /// source counts as a termination request.
    pub async fn run<S: SignalSource + ?Sized>(self, signals: &mut S) -> ShutdownReport {
        let signal = signals
            .recv()
            .await
            .unwrap_or_else(|| "signal source closed".to_string());
        info!(%signal, "stopping work");

        let stopping = self.stop(signal);
        tokio::pin!(stopping);
        let mut ignored = 0;
        let mut listening = true;
        let mut report = loop {
            tokio::select! {
                report = &mut stopping => break report,
                next = signals.recv(), if listening => match next {
                    Some(signal) => {
                        ignored += 1;
                        debug!(%signal, "already stopping, signal ignored");
                    }
                    None => listening = false,
                },
            }
        };
        report.ignored_signals = ignored;
        report
    }

    /// Run the shutdown sequence.
    pub async fn stop(self, signal: String) -> ShutdownReport {
        self.state.send_replace(ShutdownState::Stopping);

        self.hooks.cancel();
        self.pods.cancel();

        let pods = match self.pods.ack.await {
            Ok(Quiesced) => AckStatus::Quiesced,
            Err(_) => {
                error!(task = self.pods.name, "loop exited without acknowledging shutdown");
                AckStatus::Abandoned
            }
        };

        let hooks = match tokio::time::timeout(self.hook_grace, self.hooks.ack).await {
            Ok(Ok(Quiesced)) => AckStatus::Quiesced,
            Ok(Err(_)) => {
                error!(task = self.hooks.name, "loop exited without acknowledging shutdown");
                AckStatus::Abandoned
            }
            Err(_) => {
                warn!(
                    task = self.hooks.name,
                    grace = ?self.hook_grace,
                    "loop did not stop within the grace period"
                );
                AckStatus::TimedOut
            }
        };

        self.state.send_replace(ShutdownState::Stopped);
        info!(%pods, %hooks, "shutdown complete");
        ShutdownReport {
            signal,
            pods,
            hooks,
            ignored_signals: 0,
        }
    }
}
