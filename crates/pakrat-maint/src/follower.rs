//! Tailing a running maintenance job's output.

use std::io::{ErrorKind, Read};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::sink::SinkProvider;
use crate::tracker::{JobTracker, RUNNING};
use crate::{MaintError, Result};

/// The page-rendering collaborator a follower relays into. The core hands
/// over already-framed text; what "header" and "footer" look like on the
/// wire is the collaborator's business.
pub trait StatusRelay {
    fn send_header(&mut self) -> std::io::Result<()>;
    fn send_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()>;
    fn send_footer(&mut self) -> std::io::Result<()>;
}

/// How a tail ended.
#[derive(Debug, PartialEq, Eq)]
pub enum TailOutcome {
    /// Every byte the job produced was relayed.
    Completed { bytes: u64 },
    /// The bounded wait elapsed with no progress. The job may still be
    /// alive but slow; try again later.
    Stalled { bytes: u64 },
}

/// A passive observer of the running job.
///
/// Holds only a weak reference to the job tracker, upgraded to a temporary
/// strong one per poll, so a follower never extends the worker's lifetime
/// past its finish. The read handle is opened lazily and the relayed-byte
/// counter makes repeated [`Follower::tail`] calls resume where the last
/// one stopped, never re-relaying bytes.
pub struct Follower {
    tracker: Weak<JobTracker>,
    job_id: u64,
    sinks: Arc<dyn SinkProvider>,
    stall_timeout: Duration,
    relayed: u64,
    reader: Option<Box<dyn Read + Send>>,
}

impl Follower {
    pub(crate) fn new(
        tracker: Weak<JobTracker>,
        job_id: u64,
        sinks: Arc<dyn SinkProvider>,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            job_id,
            sinks,
            stall_timeout,
            relayed: 0,
            reader: None,
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.relayed
    }

    /// Relay the job's output until it completes or stalls.
    pub fn tail(&mut self, relay: &mut dyn StatusRelay) -> Result<TailOutcome> {
        relay.send_header()?;
        let outcome = self.poll_loop(relay)?;
        relay.send_footer()?;
        Ok(outcome)
    }

    fn poll_loop(&mut self, relay: &mut dyn StatusRelay) -> Result<TailOutcome> {
        loop {
            let Some(tracker) = self.tracker.upgrade() else {
                // The worker published its end offset before the tracker
                // could expire, so the sink contents are final: drain and
                // report completion.
                self.drain(relay)?;
                return Ok(TailOutcome::Completed {
                    bytes: self.relayed,
                });
            };

            let (job_id, end_offset) = {
                let state = tracker.state.lock();
                (state.job_id, state.end_offset)
            };

            if job_id == 0 && end_offset == RUNNING {
                warn!(job_id = self.job_id, "tracker lost its job mid-flight");
                return Err(MaintError::TrackerInconsistent {
                    job_id: self.job_id,
                });
            }

            if end_offset != RUNNING && self.relayed >= end_offset as u64 {
                return Ok(TailOutcome::Completed {
                    bytes: self.relayed,
                });
            }

            if self.drain(relay)? {
                // Moved bytes; re-check completion before waiting.
                continue;
            }

            // Nothing available. Wait (bounded) for the worker's notify,
            // re-checking under the tracker lock so a notify between the
            // drain and this lock is never lost.
            let mut state = tracker.state.lock();
            if state.end_offset != RUNNING || state.written > self.relayed {
                continue;
            }
            let deadline = Instant::now() + self.stall_timeout;
            let timed_out = tracker.state.wait_until(&mut state, deadline);
            if timed_out && state.end_offset == RUNNING && state.written <= self.relayed {
                debug!(
                    job_id = self.job_id,
                    relayed = self.relayed,
                    "no progress within the stall deadline"
                );
                return Ok(TailOutcome::Stalled {
                    bytes: self.relayed,
                });
            }
        }
    }

    /// Relay every byte currently available. Returns whether anything moved.
    fn drain(&mut self, relay: &mut dyn StatusRelay) -> Result<bool> {
        if self.reader.is_none() {
            let reader =
                self.sinks
                    .open_reader(self.job_id)
                    .map_err(|source| MaintError::FollowerAttach {
                        job_id: self.job_id,
                        source,
                    })?;
            self.reader = Some(reader);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };

        let mut moved = false;
        let mut buf = [0u8; 8 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    relay.send_chunk(&buf[..n])?;
                    self.relayed += n as u64;
                    moved = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(moved)
    }
}
