//! Cooperative interruption of migration runs.
//!
//! Interrupts are only observed between events of a running step. A step
//! that already started always runs to completion; the run then stops before
//! starting the next one.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 8;

/// How a run reacts to interrupts.
#[derive(Debug, Clone, Default)]
pub enum InterruptMode {
    /// Ctrl-C finishes the current step, then aborts the run.
    #[default]
    Graceful,
    /// Interrupts are not observed; the process default applies.
    NonGraceful,
    /// Interrupts are triggered through an [`InterruptHandle`].
    Handle(InterruptHandle),
}

impl InterruptMode {
    /// Arms a fresh listener. Called once per step, so nothing observed by an
    /// earlier step carries over.
    #[must_use]
    pub fn listen(&self) -> Option<Interrupt> {
        match self {
            Self::Graceful => Some(Interrupt::ctrl_c()),
            Self::NonGraceful => None,
            Self::Handle(handle) => Some(handle.subscribe()),
        }
    }
}

/// Programmatic interrupt source.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: broadcast::Sender<()>,
}

impl InterruptHandle {
    /// Creates a handle with no listeners.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Interrupts every listener currently armed; returns how many there were.
    pub fn interrupt(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    /// Arms a listener that sees interrupts sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> Interrupt {
        Interrupt {
            rx: self.tx.subscribe(),
            signal_task: None,
        }
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// An armed interrupt listener.
#[derive(Debug)]
pub struct Interrupt {
    rx: broadcast::Receiver<()>,
    signal_task: Option<JoinHandle<()>>,
}

impl Interrupt {
    fn ctrl_c() -> Self {
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let signal_task = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                debug!("Received interrupt signal");
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        Self {
            rx,
            signal_task: Some(signal_task),
        }
    }

    /// Waits for the next interrupt. Pends forever once the source is gone.
    pub async fn recv(&mut self) {
        match self.rx.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }

    /// Returns whether an interrupt is already waiting, without blocking.
    pub fn try_recv(&mut self) -> bool {
        matches!(self.rx.try_recv(), Ok(()) | Err(TryRecvError::Lagged(_)))
    }
}

impl Drop for Interrupt {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}
