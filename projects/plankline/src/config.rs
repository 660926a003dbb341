use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration consumed by the segmentation and classification cores.
///
/// Loaded once (JSON, every field optional), validated, and then shared
/// read-only behind an `Arc`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmentation: SegmentationConfig,
    pub concurrency: ConcurrencyConfig,
    pub classification: ClassificationConfig,
}

/// Detection parameters for a single frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SegmentationConfig {
    /// MSER threshold step
    pub delta: i32,
    pub min_area: i32,
    pub max_area: i32,
    pub max_variation: f64,
    pub min_diversity: f64,
    /// Overlap ratio (intersection / larger area) above which the smaller region is dropped
    pub overlap_threshold: f64,
    /// Per-column quantile used as the illumination floor
    pub flatfield_quantile: f64,
    /// Optional contrast gate in units of frame standard deviation
    pub signal_to_noise: Option<f64>,
    /// Decoding backend: "opencv" or "ffmpeg"
    pub backend: String,
    pub video_extensions: Vec<String>,
    /// Corrupt source videos are moved here when set
    pub quarantine_dir: Option<PathBuf>,
    /// Write `<video_id>_measurements.csv` with per-crop morphometry
    pub measure_particles: bool,
    /// Pixels darker than this (after smoothing) belong to a particle
    pub particle_threshold: u8,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            delta: 5,
            min_area: 60,
            max_area: 400_000,
            max_variation: 0.25,
            min_diversity: 0.2,
            overlap_threshold: 0.1,
            flatfield_quantile: 0.02,
            signal_to_noise: None,
            backend: "opencv".to_string(),
            video_extensions: vec!["avi".to_string()],
            quarantine_dir: None,
            measure_particles: true,
            particle_threshold: 253,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Frame workers per video; `None` means one less than the available cores
    pub workers: Option<usize>,
    pub queue_capacity: usize,
    pub concurrent_videos: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: None,
            queue_capacity: 64,
            concurrent_videos: 1,
        }
    }
}

impl ConcurrencyConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        })
    }
}

/// External classifier invocation and GPU slot sizing.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClassificationConfig {
    /// Classifier executable
    pub program: PathBuf,
    /// Argument template; `{images}`, `{gpu}`, `{id}` and `{result_dir}` are substituted
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Directory the classifier drops its result artifact into
    pub result_dir: PathBuf,
    pub result_extension: String,
    pub instances_per_gpu: usize,
    /// Detected with nvidia-smi when unset
    pub num_gpus: Option<usize>,
    pub invocation_timeout_secs: Option<u64>,
    pub result_wait_secs: u64,
    pub poll_interval_ms: u64,
    pub max_retries: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./scnn"),
            args: vec![
                "-unl".to_string(),
                "{images}".to_string(),
                "-cD".to_string(),
                "{gpu}".to_string(),
            ],
            working_dir: None,
            result_dir: PathBuf::from("Data"),
            result_extension: "csv".to_string(),
            instances_per_gpu: 1,
            num_gpus: None,
            invocation_timeout_secs: None,
            result_wait_secs: 30,
            poll_interval_ms: 500,
            max_retries: 1,
        }
    }
}

impl ClassificationConfig {
    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout_secs.map(Duration::from_secs)
    }

    pub fn result_wait(&self) -> Duration {
        Duration::from_secs(self.result_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let seg = &self.segmentation;
        if !(0.0..=1.0).contains(&seg.flatfield_quantile) {
            return Err(invalid("flatfield_quantile", "must lie in [0, 1]"));
        }
        if !(seg.overlap_threshold > 0.0 && seg.overlap_threshold <= 1.0) {
            return Err(invalid("overlap_threshold", "must lie in (0, 1]"));
        }
        if seg.delta <= 0 {
            return Err(invalid("delta", "must be positive"));
        }
        if seg.min_area <= 0 || seg.min_area > seg.max_area {
            return Err(invalid("min_area", "must be positive and <= max_area"));
        }
        if let Some(snr) = seg.signal_to_noise {
            if !snr.is_finite() || snr < 0.0 {
                return Err(invalid("signal_to_noise", "must be a non-negative number"));
            }
        }
        if !matches!(seg.backend.as_str(), "opencv" | "ffmpeg") {
            return Err(invalid(
                "backend",
                format!("unknown backend `{}`", seg.backend),
            ));
        }

        let conc = &self.concurrency;
        if conc.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if conc.workers == Some(0) {
            return Err(invalid("workers", "must be at least 1"));
        }
        if conc.concurrent_videos == 0 {
            return Err(invalid("concurrent_videos", "must be at least 1"));
        }

        let cls = &self.classification;
        if cls.instances_per_gpu == 0 {
            return Err(invalid("instances_per_gpu", "must be at least 1"));
        }
        if cls.num_gpus == Some(0) {
            return Err(invalid("num_gpus", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
