use crate::cli::Role;
use crate::config::TestConfig;
use crate::metrics::{utils::format_latency, LatencySummary, ThroughputMetrics};
use crate::roles::{AnomalyCounts, WorkerReport};
use crate::runner::RunOutcome;
use crate::utils::{format_bytes, format_duration};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Percentiles reported for every run.
pub const REPORT_PERCENTILES: [f64; 4] = [50.0, 90.0, 99.0, 99.9];

/// Complete record of one run, written as JSON with `--output-file`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub role: Role,
    pub config: TestConfig,
    pub duration: Duration,
    pub replies: u64,
    pub failed_workers: usize,
    pub anomalies: AnomalyCounts,
    pub throughput: ThroughputMetrics,
    /// `None` when no replies were measured.
    pub latency: Option<LatencySummary>,
    pub workers: Vec<WorkerReport>,
}

/// Run metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub seqtest_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            seqtest_version: crate::VERSION.to_string(),
        }
    }
}

impl RunReport {
    pub fn from_outcome(config: &TestConfig, outcome: &RunOutcome) -> Self {
        let mut anomalies = AnomalyCounts::default();
        for worker in &outcome.workers {
            anomalies.merge(&worker.anomalies);
        }

        Self {
            metadata: RunMetadata {
                run_id: crate::utils::generate_run_id(),
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                system_info: SystemInfo::default(),
            },
            role: outcome.role,
            config: config.clone(),
            duration: outcome.duration,
            replies: outcome.replies(),
            failed_workers: outcome.failures(),
            anomalies,
            throughput: outcome.throughput(),
            latency: outcome.latency_summary(&REPORT_PERCENTILES),
            workers: outcome.workers.clone(),
        }
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Results written to: {:?}", path);
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Run {} ({})", self.metadata.run_id, self.role)?;
        writeln!(f, "  Duration:           {}", format_duration(self.duration))?;
        writeln!(f, "  Replies:            {}", self.replies)?;
        writeln!(
            f,
            "  Frames:             {} ({:.0}/s)",
            self.throughput.total_frames, self.throughput.frames_per_second
        )?;
        writeln!(
            f,
            "  Bytes:              {} ({}/s)",
            format_bytes(self.throughput.total_bytes),
            format_bytes(self.throughput.bytes_per_second as u64)
        )?;
        if self.anomalies.total() > 0 {
            writeln!(
                f,
                "  Anomalies:          {} sequence, {} ts1 backwards, {} ts3 < ts2",
                self.anomalies.sequence,
                self.anomalies.ts_backwards,
                self.anomalies.negative_server_time
            )?;
        }
        if self.failed_workers > 0 {
            writeln!(f, "  Failed Workers:     {}", self.failed_workers)?;
            for worker in self.workers.iter().filter(|w| w.status.is_failure()) {
                writeln!(f, "    {} {}: {}", worker.kind, worker.id, worker.status)?;
            }
        }
        match &self.latency {
            Some(latency) => {
                writeln!(f, "  Latency:")?;
                writeln!(f, "    Mean:             {}", format_latency(latency.mean_ns))?;
                writeln!(f, "    Std Dev:          {}", format_latency(latency.std_dev_ns))?;
                writeln!(f, "    Min:              {}", format_latency(latency.min_ns as f64))?;
                for p in &latency.percentiles {
                    writeln!(
                        f,
                        "    P{:<17}{}",
                        format!("{}:", p.percentile),
                        format_latency(p.value_ns)
                    )?;
                }
                writeln!(f, "    Max:              {}", format_latency(latency.max_ns as f64))?;
            }
            None => writeln!(f, "  Latency:            no samples")?,
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Write one line per sample: worker id, time since run start, latency,
/// reply size and send size, whitespace separated. Returns the line count.
pub fn write_sample_dump(path: &Path, outcome: &RunOutcome) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create sample dump {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let mut lines = 0;
    for (worker_id, sample) in outcome.samples() {
        writeln!(
            out,
            "{} {} {} {} {}",
            worker_id,
            sample.observed_at.saturating_sub(outcome.started_at),
            sample.latency_ns,
            sample.reply_size,
            sample.send_size
        )?;
        lines += 1;
    }
    out.flush()
        .with_context(|| format!("Failed to flush sample dump {}", path.display()))?;
    info!("Wrote {} samples to {:?}", lines, path);
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::metrics::Sample;
    use crate::roles::{WorkerKind, WorkerStatus};
    use tempfile::NamedTempFile;

    fn outcome() -> RunOutcome {
        let mut worker = WorkerReport::new(2, WorkerKind::Synchronized);
        worker.frames_sent = 3;
        worker.frames_received = 3;
        worker.anomalies.negative_server_time = 1;
        worker.samples = (0..3u64)
            .map(|i| Sample {
                observed_at: 1_000 + i * 100,
                latency_ns: 50 + i * 10,
                send_size: 64,
                reply_size: 128,
            })
            .collect();
        RunOutcome {
            role: Role::Sync,
            started_at: 1_000,
            released_at: Some(1_000),
            duration: Duration::from_millis(5),
            workers: vec![
                worker,
                WorkerReport::failed(3, WorkerKind::Synchronized, "correlation failure"),
            ],
        }
    }

    fn config() -> TestConfig {
        TestConfig::new(Role::Sync, vec![Endpoint::new("127.0.0.1:9".parse().unwrap())])
    }

    #[test]
    fn test_report_from_outcome() {
        let report = RunReport::from_outcome(&config(), &outcome());
        assert_eq!(report.replies, 3);
        assert_eq!(report.failed_workers, 1);
        assert_eq!(report.anomalies.negative_server_time, 1);
        let latency = report.latency.as_ref().unwrap();
        assert_eq!(latency.total_samples, 3);
        assert_eq!(latency.min_ns, 50);
        assert_eq!(latency.max_ns, 70);

        let text = report.to_string();
        assert!(text.contains("Replies:            3"));
        assert!(text.contains("correlation failure"));
    }

    #[test]
    fn test_report_without_samples() {
        let mut empty = outcome();
        empty.workers.clear();
        let report = RunReport::from_outcome(&config(), &empty);
        assert!(report.latency.is_none());
        assert!(report.to_string().contains("no samples"));
    }

    #[test]
    fn test_write_json_report() {
        let file = NamedTempFile::new().unwrap();
        let report = RunReport::from_outcome(&config(), &outcome());
        report.write_json(file.path()).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(json["replies"], 3);
        assert_eq!(json["role"], "sync");
        assert_eq!(json["workers"][1]["status"]["status"], "failed");
        assert!(json["workers"][0].get("samples").is_none());
        assert_eq!(json["latency"]["percentiles"].as_array().unwrap().len(), 4);
        assert!(!json["metadata"]["run_id"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_sample_dump_lines() {
        let file = NamedTempFile::new().unwrap();
        let lines = write_sample_dump(file.path(), &outcome()).unwrap();
        assert_eq!(lines, 3);

        let text = std::fs::read_to_string(file.path()).unwrap();
        let rows: Vec<Vec<u64>> = text
            .lines()
            .map(|l| l.split_whitespace().map(|v| v.parse().unwrap()).collect())
            .collect();
        assert_eq!(rows[0], vec![2, 0, 50, 128, 64]);
        assert_eq!(rows[2], vec![2, 200, 70, 128, 64]);
    }

    #[test]
    fn test_system_info_default() {
        let info = SystemInfo::default();
        assert!(!info.os.is_empty());
        assert!(!info.architecture.is_empty());
        assert!(info.cpu_cores > 0);
        assert_eq!(info.seqtest_version, crate::VERSION);
    }

    #[test]
    fn test_worker_status_serialization() {
        let completed = serde_json::to_value(WorkerStatus::Completed).unwrap();
        assert_eq!(completed["status"], "completed");
        let failed = serde_json::to_value(WorkerStatus::Failed("x".into())).unwrap();
        assert_eq!(failed["reason"], "x");
    }
}
