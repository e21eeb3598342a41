//! Progress channel between a running migration and its caller.
//!
//! A pipe carries [`Event`]s from exactly one producer. The producer closes
//! the pipe by dropping its sender, which the consumer observes as the end of
//! the stream. A run succeeded when its stream closed without error events.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::MigrateError;
use crate::file::MigrationFile;
use crate::interrupt::Interrupt;

/// Text forwarded when a run is asked to stop.
pub const ABORT_MESSAGE: &str = "Aborting after this migration ...";

/// One progress event.
#[derive(Debug)]
pub enum Event {
    /// A script about to run.
    File(MigrationFile),
    /// Something went wrong.
    Error(MigrateError),
    /// Informational text.
    Text(String),
}

impl Event {
    /// Returns whether this is an error event.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns whether this error fails a run. Close errors are reported
    /// after the steps and never do.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error(err) if !matches!(err, MigrateError::Close(_)))
    }
}

/// How a forwarded stream (a step, or a whole run) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Closed without failure or interrupt.
    Completed,
    /// At least one failing error was forwarded.
    Failed,
    /// Interrupted, or the consumer went away.
    Aborted,
}

impl Verdict {
    /// Returns whether the next step may start.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Producing end of a pipe.
pub type PipeSender = mpsc::Sender<Event>;

/// Consuming end of a pipe.
pub type PipeReceiver = mpsc::Receiver<Event>;

/// Creates an open pipe.
///
/// The channel holds a single event, so a producer is never more than one
/// event ahead of its consumer.
#[must_use]
pub fn new() -> (PipeSender, PipeReceiver) {
    mpsc::channel(1)
}

/// Sends `err` (if any), then closes the pipe.
pub async fn close(pipe: PipeSender, err: Option<MigrateError>) {
    let Some(err) = err else {
        return;
    };
    if pipe.send(Event::Error(err)).await.is_err() {
        debug!("Pipe consumer went away before the final error was delivered");
    }
}

/// Drains `pipe` and returns only the error events, in order.
pub async fn read_errors(mut pipe: PipeReceiver) -> Vec<MigrateError> {
    let mut errors = Vec::new();
    while let Some(event) = pipe.recv().await {
        if let Event::Error(err) = event {
            errors.push(err);
        }
    }
    errors
}

async fn observe(interrupt: &mut Option<Interrupt>) {
    match interrupt {
        Some(interrupt) => interrupt.recv().await,
        None => std::future::pending().await,
    }
}

/// Forwards every event of `pipe` to `redirect` until `pipe` closes.
///
/// Interrupts are noted while forwarding but never cut the inner producer
/// short: the pipe is always drained to its end. A forwarded failure wins
/// over an interrupt; a `redirect` closed by its consumer counts as aborted.
pub async fn wait_and_redirect(
    mut pipe: PipeReceiver,
    redirect: &PipeSender,
    mut interrupt: Option<Interrupt>,
) -> Verdict {
    let mut error_received = false;
    let mut interrupts_received = 0_usize;
    let mut redirect_open = true;

    loop {
        let event = tokio::select! {
            biased;
            () = observe(&mut interrupt) => {
                interrupts_received += 1;
                if interrupts_received > 1 {
                    continue;
                }
                warn!("Interrupt received, aborting after the current migration");
                Event::Text(ABORT_MESSAGE.to_string())
            }
            event = pipe.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        error_received |= event.is_failure();
        if redirect_open && redirect.send(event).await.is_err() {
            debug!("Redirect pipe closed, discarding remaining events");
            redirect_open = false;
        }
    }

    // An interrupt racing with the end of the step still stops the run.
    if interrupts_received == 0 && interrupt.as_mut().is_some_and(Interrupt::try_recv) {
        interrupts_received += 1;
        warn!("Interrupt received, aborting");
        if redirect_open {
            let _ = redirect.send(Event::Text(ABORT_MESSAGE.to_string())).await;
        }
    }

    if error_received {
        Verdict::Failed
    } else if interrupts_received > 0 || !redirect_open {
        Verdict::Aborted
    } else {
        Verdict::Completed
    }
}
