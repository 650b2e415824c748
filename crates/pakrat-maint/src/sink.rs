//! Job output sinks: where a worker streams its log and followers read it.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use pakrat_config::MaintConfig;

/// Caller-owned mapping from job id to output sink.
///
/// The worker gets a fresh writer per job; followers get independent
/// non-blocking read handles onto the same bytes. The core never decides
/// where the bytes live.
pub trait SinkProvider: Send + Sync {
    /// Create the sink for a new job, truncating any leftover from an older
    /// job that reused the id.
    fn create(&self, job_id: u64) -> std::io::Result<Box<dyn Write + Send>>;

    /// Open a read handle on an existing job's sink, in non-blocking mode.
    fn open_reader(&self, job_id: u64) -> std::io::Result<Box<dyn Read + Send>>;
}

/// The standard provider: one log file per job under a configured
/// directory, named `<prefix><job_id>.log`.
#[derive(Debug, Clone)]
pub struct LogDirSinks {
    dir: PathBuf,
    prefix: String,
}

impl LogDirSinks {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &MaintConfig) -> Self {
        Self::new(&config.log_dir, &config.sink_prefix)
    }

    pub fn sink_path(&self, job_id: u64) -> PathBuf {
        self.dir.join(format!("{}{}.log", self.prefix, job_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkProvider for LogDirSinks {
    fn create(&self, job_id: u64) -> std::io::Result<Box<dyn Write + Send>> {
        fs::create_dir_all(&self.dir)?;
        let file = File::create(self.sink_path(job_id))?;
        Ok(Box::new(file))
    }

    fn open_reader(&self, job_id: u64) -> std::io::Result<Box<dyn Read + Send>> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(self.sink_path(job_id))?;
        Ok(Box::new(file))
    }
}
