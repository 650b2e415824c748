//! # pakrat-maint
//!
//! Single-flight background maintenance for the pakrat cache: at most one
//! maintenance job runs process-wide. The first caller to submit becomes the
//! **worker** and streams framed status output to a job-keyed sink; everyone
//! arriving while it runs becomes a **follower** that tails the same output.
//! Followers detect a finished job by the worker's published end offset (or
//! its tracker expiring) and a crashed-but-silent one by a bounded wait.
//!
//! Cancellation is cooperative: an abort request sets a process-wide flag
//! that the worker polls at checkpoints. Nothing is killed preemptively.
//!
//! The HTTP layer and the status page renderer live outside this crate;
//! they plug in through [`SinkProvider`] and [`StatusRelay`].
//! [`LogDirSinks`] is the standard provider, mapping job ids to log files
//! under the configured maintenance directory.

mod controller;
mod follower;
mod sink;
mod tracker;

pub use controller::{
    parse_abort_request, AbortOutcome, AbortRequest, CancelToken, JobHandle, MaintController, Role,
};
pub use follower::{Follower, StatusRelay, TailOutcome};
pub use sink::{LogDirSinks, SinkProvider};
pub use tracker::JobTracker;

use std::io;
use thiserror::Error;

/// First bytes every job writes to its sink.
pub const FRAME_HEADER: &str = "---- pakrat maintenance ----\n";
/// Last bytes every job writes to its sink.
pub const FRAME_FOOTER: &str = "---- maintenance complete ----\n";

/// Errors local to one submit/tail attempt. None of them tear down a running
/// job or any other follower.
#[derive(Error, Debug)]
pub enum MaintError {
    /// The job's output sink could not be created; the job never started.
    #[error("cannot open output sink for job {job_id}: {source}")]
    SinkCreate { job_id: u64, source: io::Error },

    /// This follower could not open the running job's output for reading.
    /// The worker and other followers are unaffected.
    #[error("cannot attach to output of job {job_id}: {source}")]
    FollowerAttach { job_id: u64, source: io::Error },

    /// The tracker says the job is gone but its end offset was never set.
    #[error("job {job_id}: tracker inconsistent, worker vanished without finishing")]
    TrackerInconsistent { job_id: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, MaintError>;
