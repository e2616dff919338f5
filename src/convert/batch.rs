use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::progress::ProgressTable;

/// One file of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub id: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl BatchJob {
    pub fn new(input: PathBuf, output: PathBuf) -> Self {
        Self {
            id: input.display().to_string(),
            input,
            output,
        }
    }
}

#[derive(Debug)]
pub struct BatchSummary<T> {
    pub succeeded: Vec<(BatchJob, T)>,
    pub failed: Vec<(BatchJob, String)>,
}

impl<T> BatchSummary<T> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// `input` with its extension replaced, placed in `out_dir` when given.
pub fn default_output(input: &Path, out_dir: Option<&Path>, extension: &str) -> PathBuf {
    let renamed = input.with_extension(extension);
    match (out_dir, renamed.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => renamed,
    }
}

/// Every file directly inside `dir` whose extension is in `extensions`,
/// sorted by path.
pub fn collect_jobs(
    dir: &Path,
    out_dir: Option<&Path>,
    extensions: &[&str],
    output_extension: &str,
) -> Result<Vec<BatchJob>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    let mut inputs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if matches && path.is_file() {
            inputs.push(path);
        }
    }
    inputs.sort();
    Ok(inputs
        .into_iter()
        .map(|input| {
            let output = default_output(&input, out_dir, output_extension);
            BatchJob::new(input, output)
        })
        .collect())
}

/// Runs `run` over every job on up to `workers` threads. A failing job is
/// logged and recorded; the rest of the batch keeps going.
pub fn run_batch<T, F>(
    jobs: Vec<BatchJob>,
    workers: usize,
    table: &ProgressTable,
    run: F,
) -> BatchSummary<T>
where
    T: Send,
    F: Fn(&BatchJob) -> Result<T> + Sync,
{
    for job in &jobs {
        table.register(&job.id);
    }
    let total = jobs.len();
    let workers = workers.clamp(1, total.max(1));
    let queue = Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>());
    let results = Mutex::new(Vec::with_capacity(total));

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = match queue.lock() {
                        Ok(mut guard) => guard.pop_front(),
                        Err(_) => None,
                    };
                    let Some((position, job)) = next else {
                        break;
                    };
                    let outcome = run(&job).map_err(|err| format!("{err:#}"));
                    match &outcome {
                        Ok(_) => table.complete(&job.id, job.output.clone()),
                        Err(message) => {
                            warn!(input = %job.input.display(), error = %message, "Job failed");
                            table.fail(&job.id, message.clone());
                        }
                    }
                    if let Ok(mut guard) = results.lock() {
                        guard.push((position, job, outcome));
                    }
                }
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_default();
    results.sort_by_key(|(position, _, _)| *position);

    let mut summary = BatchSummary {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for (_, job, outcome) in results {
        match outcome {
            Ok(value) => summary.succeeded.push((job, value)),
            Err(message) => summary.failed.push((job, message)),
        }
    }
    info!(
        total,
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        "Batch finished"
    );
    summary
}
