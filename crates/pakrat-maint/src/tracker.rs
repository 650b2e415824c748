//! Shared state of the one in-flight maintenance job.

use std::sync::Arc;

use pakrat_sync::Monitor;

/// `end_offset` value while the job is still producing output.
pub(crate) const RUNNING: i64 = -1;

pub(crate) struct TrackerState {
    /// Timestamp-derived identifier assigned at job start. Zero only in the
    /// inconsistent state a follower must reject.
    pub job_id: u64,
    /// Bytes the worker has written to its sink so far.
    pub written: u64,
    /// [`RUNNING`] while the job runs; the final output length afterwards.
    pub end_offset: i64,
}

/// Progress tracker for one maintenance job.
///
/// The worker holds the only strong reference; the controller publishes a
/// weak one, and followers upgrade it to a temporary strong reference for
/// the duration of each check. The worker sets `end_offset` under the
/// tracker's own lock before its strong reference goes away, so a follower
/// can never observe an expired tracker whose end offset was not yet set.
pub struct JobTracker {
    pub(crate) state: Monitor<TrackerState>,
}

impl JobTracker {
    pub(crate) fn start(job_id: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Monitor::new(TrackerState {
                job_id,
                written: 0,
                end_offset: RUNNING,
            }),
        })
    }

    pub fn job_id(&self) -> u64 {
        self.state.lock().job_id
    }

    /// Final output length, or `None` while the job is still running.
    pub fn end_offset(&self) -> Option<u64> {
        let state = self.state.lock();
        if state.end_offset == RUNNING {
            None
        } else {
            Some(state.end_offset as u64)
        }
    }

    /// Bytes written to the job's sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().written
    }
}
