//! The channel a running migration reports through.
//!
//! One pipe exists per [`crate::driver::Driver::migrate`] call. The driver
//! holds the only [`PipeWriter`]; the orchestrator holds the [`PipeReader`]
//! and drains it until the writer is gone. Closing consumes the writer, so
//! a pipe cannot be closed twice, and a writer dropped during a panic
//! closes the pipe as well, so a drain always terminates.

use crate::driver::MigrateError;
use crate::migrations::{Direction, Version};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};
use std::time::{Duration, Instant};

/// Events a writer may queue before it blocks on a slow reader.
pub const CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Statement `index` of `total` has executed.
    Statement { index: usize, total: usize },
    /// The script ran completely and was recorded.
    Done {
        version: Version,
        direction: Direction,
    },
}

#[derive(Debug)]
pub enum Event {
    Progress(Progress),
    Error(MigrateError),
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(CAPACITY);
    (PipeWriter { tx }, PipeReader { rx })
}

#[derive(Debug)]
pub struct PipeWriter {
    tx: Sender<Event>,
}

impl PipeWriter {
    pub fn progress(&self, progress: Progress) {
        self.send(Event::Progress(progress));
    }

    /// Reports the terminal error and closes the pipe.
    pub fn error(self, err: MigrateError) {
        self.send(Event::Error(err));
        self.close();
    }

    /// Reports the outcome of a migration and closes the pipe.
    pub fn finish(self, outcome: Result<Progress, MigrateError>) {
        match outcome {
            Ok(done) => {
                self.progress(done);
                self.close();
            }
            Err(e) => self.error(e),
        }
    }

    pub fn close(self) {
        trace!("closing pipe");
        drop(self.tx);
    }

    fn send(&self, event: Event) {
        // The reader may have abandoned the pipe, that is its call to make.
        if let Err(e) = self.tx.send(event) {
            debug!("pipe reader is gone, discarding {:?}", e.into_inner());
        }
    }
}

/// Everything read from a pipe up to its close.
#[derive(Debug, Default)]
pub struct Drained {
    pub progress: Vec<Progress>,
    pub errors: Vec<MigrateError>,
}

impl Drained {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// True when the writer reported [`Progress::Done`].
    pub fn completed(&self) -> bool {
        self.progress
            .iter()
            .any(|p| matches!(p, Progress::Done { .. }))
    }

    fn push(&mut self, event: Event) {
        match event {
            Event::Progress(p) => self.progress.push(p),
            Event::Error(e) => self.errors.push(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("pipe was not closed within {timeout:?}")]
pub struct DrainTimeout {
    pub timeout: Duration,
    /// Events read before the bound was reached.
    pub partial: Drained,
}

#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Event>,
}

impl PipeReader {
    /// Blocks for the next event, `None` once the pipe is closed and empty.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn drain(self) -> Drained {
        self.drain_with(|_| {})
    }

    /// Drains the pipe, handing each progress event to `observer` as it
    /// arrives.
    pub fn drain_with<F: FnMut(&Progress)>(self, mut observer: F) -> Drained {
        let mut drained = Drained::default();
        for event in self.rx.iter() {
            if let Event::Progress(ref p) = event {
                observer(p);
            }
            drained.push(event);
        }
        drained
    }

    /// Blocking drain returning only the errors seen before close.
    pub fn read_errors(self) -> Vec<MigrateError> {
        self.drain().errors
    }

    pub fn drain_timeout(self, timeout: Duration) -> Result<Drained, DrainTimeout> {
        let deadline = Instant::now() + timeout;
        let mut drained = Drained::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(event) => drained.push(event),
                Err(RecvTimeoutError::Disconnected) => return Ok(drained),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(DrainTimeout {
                        timeout,
                        partial: drained,
                    })
                }
            }
        }
    }

    /// Stops reading without draining. Later writes are discarded.
    pub fn abandon(self, reason: &str) {
        warn!(
            "abandoning pipe with {} unread event(s): {}",
            self.rx.len(),
            reason
        );
    }
}

impl IntoIterator for PipeReader {
    type Item = Event;
    type IntoIter = crossbeam_channel::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.into_iter()
    }
}
