//! The single-flight slot: who runs the job, who follows it, who aborts it.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pakrat_config::MaintConfig;
use pakrat_sync::Monitor;
use tracing::{debug, info, warn};

use crate::follower::Follower;
use crate::sink::SinkProvider;
use crate::tracker::JobTracker;
use crate::{MaintError, Result, FRAME_FOOTER, FRAME_HEADER};

/// Process-wide abort flag for the running maintenance job.
///
/// Cooperative: the worker polls it at checkpoints; nothing preempts. It is
/// cleared when a new job starts.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a submitted maintenance command turned into.
pub enum Role {
    /// No job was running; this caller owns the new one.
    Worker(JobHandle),
    /// A job is already running; this caller tails its output.
    Follower(Follower),
}

impl std::fmt::Debug for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Worker(_) => f.write_str("Role::Worker"),
            Role::Follower(_) => f.write_str("Role::Follower"),
        }
    }
}

/// Guarantees at most one maintenance job in flight process-wide.
pub struct MaintController {
    slot: Monitor<Weak<JobTracker>>,
    cancel: CancelToken,
    stall_timeout: Duration,
    last_job_id: AtomicU64,
}

impl MaintController {
    pub fn new(stall_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            slot: Monitor::new(Weak::new()),
            cancel: CancelToken::new(),
            stall_timeout,
            last_job_id: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &MaintConfig) -> Arc<Self> {
        Self::new(config.stall_timeout())
    }

    /// Submit a maintenance command.
    ///
    /// Under the controller lock: if the published tracker is still alive,
    /// the caller attaches as a follower of the running job. Otherwise the
    /// caller becomes the worker: a fresh tracker is published, the abort
    /// flag is cleared, the job's output sink is opened, and the lock is
    /// released before any real work happens.
    ///
    /// A sink that cannot be opened fails the submit; the slot stays idle.
    pub fn submit(self: &Arc<Self>, sinks: Arc<dyn SinkProvider>) -> Result<Role> {
        let mut slot = self.slot.lock();

        if let Some(tracker) = slot.upgrade() {
            let job_id = tracker.job_id();
            debug!(job_id, "maintenance job in flight, attaching follower");
            return Ok(Role::Follower(Follower::new(
                Arc::downgrade(&tracker),
                job_id,
                sinks,
                self.stall_timeout,
            )));
        }

        let job_id = self.next_job_id();
        let sink = sinks
            .create(job_id)
            .map_err(|source| MaintError::SinkCreate { job_id, source })?;

        let tracker = JobTracker::start(job_id);
        *slot = Arc::downgrade(&tracker);
        self.cancel.clear();
        slot.unlock();

        info!(job_id, "maintenance job started");
        let mut handle = JobHandle {
            tracker: Some(tracker),
            sink: Some(sink),
            cancel: self.cancel.clone(),
            job_id,
            written: 0,
            finished: false,
        };
        handle
            .write_chunk(FRAME_HEADER.as_bytes())
            .map_err(|source| MaintError::SinkCreate { job_id, source })?;
        Ok(Role::Worker(handle))
    }

    /// Set the abort flag and report the caller's redirect intent back.
    /// The core never issues the redirect itself.
    pub fn abort(&self, request: &AbortRequest) -> AbortOutcome {
        self.cancel.set();
        info!(redirect = ?request.redirect_to, "maintenance abort requested");
        AbortOutcome {
            redirect_to: request.redirect_to.clone(),
        }
    }

    /// The process-wide abort flag.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Id of the currently running job, if any.
    pub fn current_job_id(&self) -> Option<u64> {
        self.slot.lock().upgrade().map(|t| t.job_id())
    }

    /// Job ids derive from the wall clock; the bump keeps them strictly
    /// increasing when two jobs start within one second.
    fn next_job_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut prev = self.last_job_id.load(Ordering::Relaxed);
        loop {
            let id = now.max(prev + 1);
            match self.last_job_id.compare_exchange(
                prev,
                id,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return id,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// The worker side of one maintenance job.
///
/// Progress written here is counted and mirrored into the tracker so
/// followers can tail it. Finishing (explicitly or by drop, so aborted and
/// erroring workers finalize too) writes the footer, publishes the final
/// output length under the tracker lock, wakes every follower, and releases
/// the single-flight slot.
pub struct JobHandle {
    tracker: Option<Arc<JobTracker>>,
    sink: Option<Box<dyn Write + Send>>,
    cancel: CancelToken,
    job_id: u64,
    written: u64,
    finished: bool,
}

impl JobHandle {
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Abort checkpoint. Call between units of work and stop early when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    /// Stream free-form progress bytes to the job's sink.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let sink = self
            .sink
            .as_mut()
            .expect("write after finish() on a job handle");
        sink.write_all(chunk)?;
        sink.flush()?;
        self.written += chunk.len() as u64;

        if let Some(tracker) = &self.tracker {
            {
                let mut state = tracker.state.lock();
                state.written = self.written;
            }
            tracker.state.notify_all();
        }
        Ok(())
    }

    /// Convenience for line-oriented progress text.
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut owned = String::with_capacity(line.len() + 1);
        owned.push_str(line);
        owned.push('\n');
        self.write_chunk(owned.as_bytes())
    }

    /// Finish the job and return the total bytes produced.
    pub fn finish(mut self) -> u64 {
        self.finalize();
        self.written
    }

    fn finalize(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Some(mut sink) = self.sink.take() {
            match sink.write_all(FRAME_FOOTER.as_bytes()) {
                Ok(()) => self.written += FRAME_FOOTER.len() as u64,
                Err(e) => warn!(job_id = self.job_id, error = %e, "footer write failed"),
            }
            let _ = sink.flush();
        }

        if let Some(tracker) = self.tracker.take() {
            {
                let mut state = tracker.state.lock();
                state.written = self.written;
                state.end_offset = self.written as i64;
            }
            tracker.state.notify_all();
            // Strong reference drops here; the slot reads as idle from now on.
        }
        info!(job_id = self.job_id, bytes = self.written, "maintenance job finished");
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// A recognized abort command, possibly carrying a redirect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortRequest {
    pub redirect_to: Option<String>,
}

/// The caller should respond with an HTTP 302 to `redirect_to` when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    pub redirect_to: Option<String>,
}

/// Scan a request query string (`k=v&k2=v2`) for the abort marker.
///
/// Returns `None` when the query carries no abort command. The rest of the
/// request is the HTTP layer's business.
pub fn parse_abort_request(query: &str) -> Option<AbortRequest> {
    let mut is_abort = false;
    let mut redirect_to = None;

    for param in query.split('&') {
        let (key, value) = match param.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (param, None),
        };
        match key {
            "abort" => is_abort = true,
            "redirect" => redirect_to = value.filter(|v| !v.is_empty()).map(str::to_owned),
            _ => {}
        }
    }

    is_abort.then_some(AbortRequest { redirect_to })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ignores_non_abort_queries() {
        assert_eq!(parse_abort_request(""), None);
        assert_eq!(parse_abort_request("doExpire=1&treeView=1"), None);
    }

    #[test]
    fn parse_recognizes_abort_marker() {
        assert_eq!(
            parse_abort_request("abort"),
            Some(AbortRequest { redirect_to: None })
        );
        assert_eq!(
            parse_abort_request("abort=1"),
            Some(AbortRequest { redirect_to: None })
        );
    }

    #[test]
    fn parse_carries_redirect_target() {
        assert_eq!(
            parse_abort_request("abort=1&redirect=/maint.html"),
            Some(AbortRequest {
                redirect_to: Some("/maint.html".to_owned()),
            })
        );
        assert_eq!(
            parse_abort_request("redirect=&abort"),
            Some(AbortRequest { redirect_to: None })
        );
    }

    #[test]
    fn abort_sets_flag_and_reports_redirect() {
        let controller = MaintController::new(Duration::from_secs(30));
        assert!(!controller.cancel_token().is_set());

        let outcome = controller.abort(&AbortRequest {
            redirect_to: Some("/status".to_owned()),
        });
        assert!(controller.cancel_token().is_set());
        assert_eq!(outcome.redirect_to.as_deref(), Some("/status"));
    }

    #[test]
    fn job_ids_strictly_increase_within_one_second() {
        let controller = MaintController::new(Duration::from_secs(30));
        let a = controller.next_job_id();
        let b = controller.next_job_id();
        let c = controller.next_job_id();
        assert!(a < b && b < c);
    }
}
