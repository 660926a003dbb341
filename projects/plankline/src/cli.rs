use crate::config::PipelineConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON pipeline configuration; built-in defaults apply when omitted
    #[arg(long, global = true, env = "PLANKLINE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Segment raw videos into particle crops and measurement tables
    Segment(SegmentArgs),
    /// Run the external classifier over segmented runs on the available GPUs
    Classify(ClassifyArgs),
}

#[derive(clap::Args, Debug)]
pub struct SegmentArgs {
    /// Root directory for raw video files
    #[arg(long, env = "PLANKLINE_VIDEO_ROOT")]
    pub video_root: PathBuf,

    /// Root directory for segmentation output
    #[arg(long, env = "PLANKLINE_SEGMENT_ROOT")]
    pub output_root: PathBuf,

    /// Frame workers per video
    #[arg(long)]
    pub workers: Option<usize>,

    /// Frames allowed to wait between the reader and the workers
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Videos processed at the same time
    #[arg(long)]
    pub concurrent_videos: Option<usize>,

    /// Video decoding backend (opencv, ffmpeg)
    #[arg(long)]
    pub backend: Option<String>,

    /// Overlap ratio above which the smaller of two regions is dropped
    #[arg(long)]
    pub overlap_threshold: Option<f64>,

    /// Directory that unreadable videos are moved into
    #[arg(long, env = "PLANKLINE_QUARANTINE_DIR")]
    pub quarantine_dir: Option<PathBuf>,

    /// Segment again even when a video's previous run completed
    #[arg(long)]
    pub force: bool,
}

impl SegmentArgs {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.concurrency.workers = Some(workers);
        }
        if let Some(capacity) = self.queue_capacity {
            config.concurrency.queue_capacity = capacity;
        }
        if let Some(videos) = self.concurrent_videos {
            config.concurrency.concurrent_videos = videos;
        }
        if let Some(backend) = &self.backend {
            config.segmentation.backend = backend.clone();
        }
        if let Some(threshold) = self.overlap_threshold {
            config.segmentation.overlap_threshold = threshold;
        }
        if let Some(dir) = &self.quarantine_dir {
            config.segmentation.quarantine_dir = Some(dir.clone());
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ClassifyArgs {
    /// Root directory holding segmentation runs
    #[arg(long, env = "PLANKLINE_SEGMENT_ROOT")]
    pub segment_root: PathBuf,

    /// Root directory for classification results and logs
    #[arg(long, env = "PLANKLINE_CLASSIFY_ROOT")]
    pub output_root: PathBuf,

    /// Classifier executable
    #[arg(long, env = "PLANKLINE_CLASSIFIER")]
    pub program: Option<PathBuf>,

    /// Number of GPUs; detected with nvidia-smi when omitted
    #[arg(long)]
    pub num_gpus: Option<usize>,

    /// Classifier instances sharing one GPU
    #[arg(long)]
    pub instances_per_gpu: Option<usize>,

    /// Kill a classifier run after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub max_retries: Option<usize>,

    /// Classify again even when an item's result is already in place
    #[arg(long)]
    pub force: bool,
}

impl ClassifyArgs {
    pub fn apply(&self, config: &mut PipelineConfig) {
        let cls = &mut config.classification;
        if let Some(program) = &self.program {
            cls.program = program.clone();
        }
        if let Some(n) = self.num_gpus {
            cls.num_gpus = Some(n);
        }
        if let Some(n) = self.instances_per_gpu {
            cls.instances_per_gpu = n;
        }
        if let Some(secs) = self.timeout_secs {
            cls.invocation_timeout_secs = Some(secs);
        }
        if let Some(n) = self.max_retries {
            cls.max_retries = n;
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_flags_override_config() {
        let args = Args::try_parse_from([
            "plankline",
            "segment",
            "--video-root",
            "/raw",
            "--output-root",
            "/segment",
            "--workers",
            "6",
            "--backend",
            "ffmpeg",
        ])
        .unwrap();

        let mut config = PipelineConfig::default();
        match &args.command {
            Command::Segment(seg) => {
                assert_eq!(seg.video_root, PathBuf::from("/raw"));
                seg.apply(&mut config);
            }
            Command::Classify(_) => panic!("expected segment"),
        }
        assert_eq!(config.concurrency.workers, Some(6));
        if let Command::Segment(seg) = &args.command {
            assert!(!seg.force);
        }
        assert_eq!(config.segmentation.backend, "ffmpeg");
        assert_eq!(config.concurrency.queue_capacity, 64);
    }

    #[test]
    fn test_classify_flags_override_config() {
        let args = Args::try_parse_from([
            "plankline",
            "classify",
            "--segment-root",
            "/segment",
            "--output-root",
            "/classified",
            "--num-gpus",
            "2",
            "--instances-per-gpu",
            "3",
            "--force",
        ])
        .unwrap();

        let mut config = PipelineConfig::default();
        match &args.command {
            Command::Classify(cls) => {
                assert!(cls.force);
                cls.apply(&mut config);
            }
            Command::Segment(_) => panic!("expected classify"),
        }
        assert_eq!(config.classification.num_gpus, Some(2));
        assert_eq!(config.classification.instances_per_gpu, 3);
        assert_eq!(config.classification.max_retries, 1);
    }
}
