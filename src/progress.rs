//! Progress reporting for conversion jobs.
//!
//! Jobs push [`ProgressUpdate`]s into a [`ProgressSink`]. The sink is usually
//! a closure or a [`ProgressTable`] shared between jobs running on different
//! threads; each job only ever writes its own key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

/// One progress observation for a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub done: u64,
    pub total: u64,
    pub elapsed: Duration,
    /// `None` until at least one unit of work is done.
    pub eta: Option<Duration>,
    /// 0..=99 while running, 100 only on the final update of a successful job.
    pub percent: u8,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, job_id: &str, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&str, &ProgressUpdate) + Send + Sync,
{
    fn report(&self, job_id: &str, update: &ProgressUpdate) {
        self(job_id, update)
    }
}

/// Computes progress updates for a job with a known (estimated) amount of
/// work.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    started: Instant,
    total: u64,
    done: u64,
}

impl ProgressMeter {
    pub fn new(total: u64) -> Self {
        Self::started_at(Instant::now(), total)
    }

    pub fn started_at(started: Instant, total: u64) -> Self {
        Self {
            started,
            total: total.max(1),
            done: 0,
        }
    }

    /// Records one more unit of work.
    pub fn advance(&mut self) -> ProgressUpdate {
        self.done += 1;
        self.update_at(self.started.elapsed())
    }

    /// The closing update: 100 percent, with the total snapped to the work
    /// actually done.
    pub fn finish(&self) -> ProgressUpdate {
        ProgressUpdate {
            done: self.done,
            total: self.done.max(1),
            elapsed: self.started.elapsed(),
            eta: Some(Duration::ZERO),
            percent: 100,
        }
    }

    fn update_at(&self, elapsed: Duration) -> ProgressUpdate {
        let remaining = self.total.saturating_sub(self.done);
        let eta = (self.done > 0).then(|| {
            Duration::from_secs_f64(elapsed.as_secs_f64() / self.done as f64 * remaining as f64)
        });
        let percent = (self.done.saturating_mul(100) / self.total).min(99) as u8;
        ProgressUpdate {
            done: self.done,
            total: self.total,
            elapsed,
            eta,
            percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Queued,
    Running,
    Completed { output: PathBuf },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub state: JobState,
    pub progress: Option<ProgressUpdate>,
}

impl JobStatus {
    fn queued() -> Self {
        Self {
            state: JobState::Queued,
            progress: None,
        }
    }
}

/// Caller-owned job table, safe to share across job threads.
#[derive(Debug, Clone, Default)]
pub struct ProgressTable {
    inner: Arc<Mutex<HashMap<String, JobStatus>>>,
}

impl ProgressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str) {
        self.update(job_id, |status| *status = JobStatus::queued());
    }

    pub fn complete(&self, job_id: &str, output: PathBuf) {
        self.update(job_id, |status| status.state = JobState::Completed { output });
    }

    pub fn fail(&self, job_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.update(job_id, |status| status.state = JobState::Failed { error });
    }

    pub fn get(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.lock().ok()?.get(job_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, JobStatus> {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn remove(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.lock().ok()?.remove(job_id)
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut JobStatus)) {
        match self.inner.lock() {
            Ok(mut guard) => {
                let status = guard
                    .entry(job_id.to_string())
                    .or_insert_with(JobStatus::queued);
                apply(status);
            }
            Err(_) => warn!(
                job = job_id,
                "Progress table lock poisoned; dropping update"
            ),
        }
    }
}

impl ProgressSink for ProgressTable {
    fn report(&self, job_id: &str, update: &ProgressUpdate) {
        let update = *update;
        self.update(job_id, |status| {
            if matches!(status.state, JobState::Queued) {
                status.state = JobState::Running;
            }
            status.progress = Some(update);
        });
    }
}
