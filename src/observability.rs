use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Stage names recorded by the conversion jobs.
pub mod stage {
    pub const PROBE: &str = "probe";
    pub const FRAMES: &str = "frames";
    pub const AUDIO: &str = "audio";
    pub const WRITE: &str = "write";
    pub const EXTRACT: &str = "extract";
    pub const ASSEMBLE: &str = "assemble";
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub frames_kept: u64,
    pub frames_skipped: u64,
    pub bytes_written: u64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Per-job metrics. Cheap to clone; clones share the same snapshot.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_frame_kept(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.frames_kept += 1;
        }
    }

    pub fn record_frame_skipped(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.frames_skipped += 1;
        }
    }

    pub fn record_bytes_written(&self, bytes: u64) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.bytes_written += bytes;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

/// Records the elapsed time of a stage when stopped or dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    pub fn stop(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(job_id: &str, snapshot: &MetricsSnapshot) {
    info!(
        job = job_id,
        total_duration_ms = snapshot.total_duration_ms,
        frames_kept = snapshot.frames_kept,
        frames_skipped = snapshot.frames_skipped,
        bytes_written = snapshot.bytes_written,
        "Job metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            job = job_id,
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

/// Writes one snapshot per job as a pretty JSON object keyed by job id.
pub fn write_metrics_json(
    path: &Path,
    snapshots: &BTreeMap<String, MetricsSnapshot>,
) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshots).context("failed to serialize metrics")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), jobs = snapshots.len(), "Metrics written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_accumulate_per_stage() {
        let metrics = MetricsCollector::new();
        metrics.start_stage(stage::FRAMES).stop();
        {
            let _timer = metrics.start_stage(stage::FRAMES);
        }
        metrics.start_stage(stage::WRITE).stop();
        metrics.record_frame_kept();
        metrics.record_frame_skipped();
        metrics.record_frame_skipped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stages[stage::FRAMES].calls, 2);
        assert_eq!(snapshot.stages[stage::WRITE].calls, 1);
        assert_eq!(snapshot.frames_kept, 1);
        assert_eq!(snapshot.frames_skipped, 2);
    }

    #[test]
    fn clones_share_a_snapshot() {
        let metrics = MetricsCollector::new();
        metrics.clone().record_bytes_written(42);
        assert_eq!(metrics.snapshot().bytes_written, 42);
    }

    #[test]
    fn metrics_json_is_keyed_by_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/metrics.json");
        let mut snapshots = BTreeMap::new();
        snapshots.insert("clip".to_string(), MetricsSnapshot::default());
        write_metrics_json(&path, &snapshots).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value["clip"]["stages"].is_object());
    }
}
