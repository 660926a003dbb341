// Pipeline orchestrator: manages the video processing lifecycle
//
// Coordinates one reader and a pool of segment workers per video, tracks
// processing state, and drives several videos through the pipeline.

use crate::cancel::CancelToken;
use crate::config::{ConcurrencyConfig, PipelineConfig};
use crate::error::SegmentError;
use crate::pipeline::crop::CropWriter;
use crate::pipeline::measure::ParticleMeasurer;
use crate::pipeline::reader::{read_worker, FrameSource};
use crate::pipeline::segment_worker::{segment_worker, FrameProcessor, SegmentationProcessor};
use crate::pipeline::types::{Frame, FrameCounts, ProcessingState, VideoState};
use crate::run_artifacts::RunSummary;
use crate::run_context;
use crossbeam::channel;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// Bounded producer/consumer pipeline for the frames of one video.
///
/// One reader thread pushes frames into a queue of `queue_capacity` slots;
/// `workers` threads pull and process them. The reader blocks while the queue
/// is full, so at most `queue_capacity` frames wait between the stages.
#[derive(Debug, Clone, Copy)]
pub struct FramePipeline {
    workers: usize,
    queue_capacity: usize,
}

impl FramePipeline {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self {
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(config.effective_workers(), config.queue_capacity)
    }

    /// Runs every frame through `processor` and returns once the source is
    /// exhausted (or cancelled) and the queue has drained.
    pub fn run<I, P>(
        &self,
        frames: I,
        processor: &P,
        state: &ProcessingState,
        cancel: &CancelToken,
    ) -> FrameCounts
    where
        I: Iterator<Item = Frame> + Send,
        P: FrameProcessor,
    {
        state.transition(VideoState::Processing);
        let (tx, rx) = channel::bounded::<Frame>(self.queue_capacity);

        thread::scope(|scope| {
            scope.spawn(move || {
                tracing::info!("Spawning new reader worker for {}", state.video_id);
                let sent = read_worker(frames, tx, state, cancel);
                tracing::info!("Reader worker finished gracefully after {} frames", sent);
            });

            for worker_id in 0..self.workers {
                let rx = rx.clone();
                state.active_workers.fetch_add(1, Ordering::Relaxed);
                scope.spawn(move || {
                    tracing::debug!("Spawning new segment worker {}", worker_id);
                    segment_worker(rx, processor, state);
                    state.active_workers.fetch_sub(1, Ordering::Relaxed);
                    tracing::debug!("Segment worker {} finished gracefully", worker_id);
                });
            }
        });

        state.counts()
    }
}

/// Final outcome of one video.
#[derive(Debug, Clone)]
pub struct VideoReport {
    pub video_id: String,
    pub video_path: PathBuf,
    pub state: VideoState,
    pub counts: FrameCounts,
    /// Output from an earlier complete run was kept instead of segmenting again
    pub skipped: bool,
}

impl VideoReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.state, VideoState::Failed(_))
    }
}

/// Segments one video into `<output_root>/<video_id>/`.
///
/// A video that cannot be opened gets `<output_root>/<video_id>_error.txt`
/// and, when configured, is moved into the quarantine directory.
pub fn run_video(
    video_path: &Path,
    config: &PipelineConfig,
    output_root: &Path,
    cancel: &CancelToken,
) -> Result<VideoReport, SegmentError> {
    let video_id = run_context::video_id_for(video_path).ok_or_else(|| {
        SegmentError::CorruptInput {
            path: video_path.to_path_buf(),
            reason: "file name has no usable stem".to_string(),
        }
    })?;
    let state = ProcessingState::new(video_id.clone(), 0);

    state.transition(VideoState::Decoding);
    let source = match FrameSource::open(video_path, &video_id, &config.segmentation.backend) {
        Ok(source) => source,
        Err(e) => {
            state.transition(VideoState::Failed(e.to_string()));
            handle_corrupt(video_path, &video_id, &e, config, output_root);
            return Err(e);
        }
    };

    segment_source(source, video_path, &state, config, output_root, cancel)
}

/// Runs an opened source through the pipeline and records the run.
///
/// A source that stops on a decode error leaves its partial output in place,
/// but the video is marked failed and gets an error marker.
pub(crate) fn segment_source(
    mut source: FrameSource,
    video_path: &Path,
    state: &ProcessingState,
    config: &PipelineConfig,
    output_root: &Path,
    cancel: &CancelToken,
) -> Result<VideoReport, SegmentError> {
    let video_id = state.video_id.clone();
    state
        .expected_frames
        .store(source.expected_frames(), Ordering::Relaxed);

    let mut metadata = run_context::create_run(output_root, video_path, &video_id)
        .map_err(|e| SegmentError::write_failure(output_root.join(&video_id), format!("{:#}", e)))?;
    let mut writer = CropWriter::create(&metadata.output_dir, &video_id)?;
    if config.segmentation.measure_particles {
        writer = writer.with_measurer(ParticleMeasurer::new(config.segmentation.particle_threshold))?;
    }
    let processor = SegmentationProcessor::new(&config.segmentation, writer);

    let pipeline = FramePipeline::from_config(&config.concurrency);
    tracing::info!(
        "{}: segmenting ~{} frames ({:.1} fps) with {} workers",
        video_id,
        source.expected_frames(),
        source.source_fps(),
        pipeline.workers
    );
    let counts = pipeline.run(&mut source, &processor, state, cancel);

    let decode_error = source.decode_error().map(str::to_string);
    match &decode_error {
        Some(reason) => {
            tracing::error!("{}: {}", video_id, reason);
            state.transition(VideoState::Failed(reason.clone()));
            if let Err(e) = run_context::write_error_marker(output_root, &video_id, reason) {
                tracing::error!("{}: could not write error marker: {:#}", video_id, e);
            }
        }
        None => state.transition(VideoState::Completed),
    }

    let cancelled = cancel.is_cancelled();
    if cancelled {
        tracing::warn!(
            "{}: cancelled after {} frames",
            video_id,
            counts.frames_read
        );
    }
    tracing::info!(
        "{}: {:?}, {} frames, {} blank, {} failed, {} crops",
        video_id,
        state.state(),
        counts.frames_processed,
        counts.frames_blank,
        counts.frames_failed,
        counts.crops_written
    );
    tracing::debug!("{}", state.to_progress_json());

    let summary = RunSummary {
        state: state.state(),
        counts: counts.clone(),
        elapsed_secs: state.start_time.elapsed().as_secs_f64(),
        cancelled,
        decode_error,
    };
    run_context::write_summary(&mut metadata, summary).map_err(|e| {
        let path = metadata.output_dir.join(run_context::METADATA_FILE);
        SegmentError::write_failure(path, format!("{:#}", e))
    })?;

    Ok(VideoReport {
        video_id,
        video_path: video_path.to_path_buf(),
        state: state.state(),
        counts,
        skipped: false,
    })
}

fn handle_corrupt(
    video_path: &Path,
    video_id: &str,
    error: &SegmentError,
    config: &PipelineConfig,
    output_root: &Path,
) {
    tracing::error!("{}: {}", video_id, error);
    if let Err(e) = run_context::write_error_marker(output_root, video_id, &error.to_string()) {
        tracing::error!("{}: could not write error marker: {:#}", video_id, e);
    }
    if let Some(dir) = &config.segmentation.quarantine_dir {
        match run_context::quarantine(video_path, dir) {
            Ok(dest) => tracing::warn!("{}: moved to {:?}", video_id, dest),
            Err(e) => tracing::error!("{}: could not quarantine: {:#}", video_id, e),
        }
    }
}

/// Report for a video whose existing run already covers it, if there is one.
fn completed_report(video_path: &Path, output_root: &Path) -> Option<VideoReport> {
    let video_id = run_context::video_id_for(video_path)?;
    let run = run_context::load_run(output_root, &video_id).ok().flatten()?;
    if !run.is_complete() {
        return None;
    }
    let summary = run.summary?;
    Some(VideoReport {
        video_id,
        video_path: video_path.to_path_buf(),
        state: summary.state,
        counts: summary.counts,
        skipped: true,
    })
}

/// Segments every video, `concurrent_videos` at a time. Reports are sorted by video id.
///
/// Videos whose previous run completed are skipped unless `force` is set.
/// Files that share a video id would overwrite each other's output, so all of
/// them are rejected without being opened.
pub fn segment_videos(
    videos: &[PathBuf],
    config: Arc<PipelineConfig>,
    output_root: &Path,
    cancel: &CancelToken,
    force: bool,
) -> Vec<VideoReport> {
    let mut reports = Vec::new();
    let duplicates = run_context::duplicate_ids(videos);
    for (video_id, paths) in &duplicates {
        tracing::error!("{}: video id shared by {:?}", video_id, paths);
        for path in paths {
            reports.push(VideoReport {
                video_id: video_id.clone(),
                video_path: path.clone(),
                state: VideoState::Failed(format!(
                    "video id {} is shared by {} input files",
                    video_id,
                    paths.len()
                )),
                counts: FrameCounts::default(),
                skipped: false,
            });
        }
    }

    let mut pending = Vec::new();
    for video in videos {
        let duplicated = run_context::video_id_for(video)
            .map(|id| duplicates.contains_key(&id))
            .unwrap_or(false);
        if duplicated {
            continue;
        }
        match completed_report(video, output_root).filter(|_| !force) {
            Some(report) => {
                tracing::info!("{}: already segmented, skipping", report.video_id);
                reports.push(report);
            }
            None => pending.push(video.clone()),
        }
    }

    let pb = ProgressBar::new(pending.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} videos ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let (job_tx, job_rx) = channel::unbounded::<PathBuf>();
    for video in &pending {
        // Receiver is alive until the scope below ends
        let _ = job_tx.send(video.clone());
    }
    drop(job_tx);
    let (report_tx, report_rx) = channel::unbounded::<VideoReport>();

    let video_workers = config.concurrency.concurrent_videos.max(1).min(pending.len().max(1));
    thread::scope(|scope| {
        for _ in 0..video_workers {
            let job_rx = job_rx.clone();
            let report_tx = report_tx.clone();
            let config = config.clone();
            let pb = pb.clone();
            scope.spawn(move || {
                for video_path in job_rx.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    pb.set_message(video_path.display().to_string());
                    let report = match run_video(&video_path, &config, output_root, cancel) {
                        Ok(report) => report,
                        Err(e) => failed_report(&video_path, e),
                    };
                    pb.inc(1);
                    let _ = report_tx.send(report);
                }
            });
        }
    });
    drop(report_tx);
    pb.finish_with_message("Done");

    reports.extend(report_rx.iter());
    reports.sort_by(|a, b| a.video_id.cmp(&b.video_id).then(a.video_path.cmp(&b.video_path)));
    reports
}

fn failed_report(video_path: &Path, error: SegmentError) -> VideoReport {
    VideoReport {
        video_id: run_context::video_id_for(video_path)
            .unwrap_or_else(|| video_path.display().to_string()),
        video_path: video_path.to_path_buf(),
        state: VideoState::Failed(error.to_string()),
        counts: FrameCounts::default(),
        skipped: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::crop::tests::{png_files, read_rows, scratch_dir};
    use crate::pipeline::reader::tests::ScriptedReader;
    use crate::pipeline::types::FrameOutcome;
    use crate::run_artifacts::stats_filename;
    use anyhow::anyhow;
    use image::{GrayImage, Luma};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    fn synthetic_frames(count: usize) -> impl Iterator<Item = Frame> + Send {
        (1..=count).map(|i| Frame {
            video_id: "synthetic".to_string(),
            frame_index: i,
            pixels: GrayImage::new(2, 2),
        })
    }

    /// Counts frames as the reader pulls them from the source.
    struct CountingFrames<I> {
        inner: I,
        pulled: Arc<AtomicUsize>,
    }

    impl<I: Iterator<Item = Frame>> Iterator for CountingFrames<I> {
        type Item = Frame;
        fn next(&mut self) -> Option<Frame> {
            let frame = self.inner.next()?;
            self.pulled.fetch_add(1, Ordering::SeqCst);
            Some(frame)
        }
    }

    /// Processor that blocks every frame until the gate is opened.
    struct GatedProcessor {
        open: Mutex<bool>,
        opened: Condvar,
        entered: AtomicUsize,
    }

    impl GatedProcessor {
        fn new() -> Self {
            Self {
                open: Mutex::new(false),
                opened: Condvar::new(),
                entered: AtomicUsize::new(0),
            }
        }

        fn release(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    impl FrameProcessor for GatedProcessor {
        fn process(&self, _frame: &Frame) -> Result<FrameOutcome, SegmentError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
            Ok(FrameOutcome::Crops(1))
        }
    }

    #[test]
    fn test_backpressure_bounds_frames_in_flight() {
        let pipeline = FramePipeline::new(1, 2);
        let state = ProcessingState::new("synthetic".to_string(), 20);
        let processor = GatedProcessor::new();
        let pulled = Arc::new(AtomicUsize::new(0));
        let frames = CountingFrames {
            inner: synthetic_frames(20),
            pulled: pulled.clone(),
        };
        let cancel = CancelToken::new();

        let counts = thread::scope(|scope| {
            let handle = scope.spawn(|| pipeline.run(frames, &processor, &state, &cancel));

            // One frame held by the blocked worker, two queued, one pulled and waiting on send
            thread::sleep(Duration::from_millis(300));
            let first = pulled.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            let second = pulled.load(Ordering::SeqCst);
            assert_eq!(first, second, "reader kept pulling while the queue was full");
            assert!(first <= 4, "pulled {} frames with capacity 2 and one worker", first);
            assert_eq!(processor.entered.load(Ordering::SeqCst), 1);

            processor.release();
            handle.join().unwrap()
        });

        assert_eq!(counts.frames_read, 20);
        assert_eq!(counts.frames_processed, 20);
        assert_eq!(counts.crops_written, 20);
        assert_eq!(state.state(), VideoState::Processing);
    }

    #[test]
    fn test_blank_and_failed_frames_are_accounted() {
        let pipeline = FramePipeline::new(3, 4);
        let state = ProcessingState::new("synthetic".to_string(), 30);
        let processor = |frame: &Frame| -> Result<FrameOutcome, SegmentError> {
            match frame.frame_index % 3 {
                0 => Ok(FrameOutcome::Blank),
                1 => Ok(FrameOutcome::Crops(2)),
                _ if frame.frame_index == 5 => panic!("bad frame"),
                _ => Err(SegmentError::write_failure("/tmp/x.png", "no space")),
            }
        };

        let counts = pipeline.run(synthetic_frames(30), &processor, &state, &CancelToken::new());

        assert_eq!(counts.frames_read, 30);
        assert_eq!(counts.frames_processed + counts.frames_failed, 30);
        assert_eq!(counts.frames_blank, 10);
        assert_eq!(counts.frames_failed, 10);
        assert_eq!(counts.crops_written, 20);
        assert_eq!(state.active_workers.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_cancelled_pipeline_drains_and_stops() {
        let pipeline = FramePipeline::new(2, 2);
        let state = ProcessingState::new("synthetic".to_string(), 1000);
        let cancel = CancelToken::new();
        let seen = AtomicUsize::new(0);
        let processor = |_: &Frame| -> Result<FrameOutcome, SegmentError> {
            if seen.fetch_add(1, Ordering::SeqCst) == 5 {
                cancel.cancel();
            }
            Ok(FrameOutcome::Blank)
        };

        let counts = pipeline.run(synthetic_frames(1000), &processor, &state, &cancel);

        assert!(counts.frames_read < 1000);
        assert_eq!(counts.frames_processed, counts.frames_read);
    }

    #[test]
    fn test_corrupt_video_writes_error_marker() {
        let input = scratch_dir("orchestrator-corrupt-in");
        let output = scratch_dir("orchestrator-corrupt-out");
        let quarantine = input.join("raw_corrupt");
        let video = input.join("broken.avi");
        std::fs::write(&video, b"definitely not a video").unwrap();

        let mut config = PipelineConfig::default();
        config.segmentation.quarantine_dir = Some(quarantine.clone());
        let reports = segment_videos(
            &[video.clone()],
            Arc::new(config),
            &output,
            &CancelToken::new(),
            false,
        );

        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_failed());
        assert_eq!(reports[0].video_id, "broken");
        assert!(output.join("broken_error.txt").exists());
        assert!(!output.join("broken").exists());
        assert!(quarantine.join("broken.avi").exists());
        assert!(!video.exists());

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }

    /// Bright field with one dark particle whose column depends on the frame.
    fn particle_frame(index: u32) -> GrayImage {
        let x0 = 10 + 12 * index;
        GrayImage::from_fn(120, 400, |x, y| {
            if (x0..x0 + 20).contains(&x) && (200..206).contains(&y) {
                Luma([20])
            } else {
                Luma([200])
            }
        })
    }

    fn scripted_source(script: Vec<anyhow::Result<GrayImage>>) -> FrameSource {
        let reader = ScriptedReader {
            script: VecDeque::from(script),
        };
        FrameSource::from_reader(Box::new(reader), Path::new("/raw/scripted.avi"), "scripted")
            .unwrap()
    }

    fn small_pipeline_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.concurrency.workers = Some(3);
        config.concurrency.queue_capacity = 2;
        config
    }

    fn segment_scripted(
        script: Vec<anyhow::Result<GrayImage>>,
        config: &PipelineConfig,
        output: &Path,
    ) -> VideoReport {
        let state = ProcessingState::new("scripted".to_string(), 0);
        segment_source(
            scripted_source(script),
            Path::new("/raw/scripted.avi"),
            &state,
            config,
            output,
            &CancelToken::new(),
        )
        .unwrap()
    }

    fn six_frames() -> Vec<anyhow::Result<GrayImage>> {
        (1..=6)
            .map(|i| {
                if i % 2 == 0 {
                    Ok(GrayImage::from_pixel(120, 400, Luma([200])))
                } else {
                    Ok(particle_frame(i))
                }
            })
            .collect()
    }

    #[test]
    fn test_segmentation_output_is_consistent_and_reproducible() {
        let output = scratch_dir("orchestrator-e2e");
        let config = small_pipeline_config();
        let run_dir = output.join("scripted");

        let first = segment_scripted(six_frames(), &config, &output);
        assert_eq!(first.state, VideoState::Completed);
        assert_eq!(first.counts.frames_read, 6);
        assert_eq!(first.counts.frames_blank, 3);
        assert_eq!(first.counts.frames_failed, 0);

        let pngs = png_files(&run_dir);
        let mut row_files: Vec<String> = read_rows(&run_dir.join(stats_filename("scripted")))
            .into_iter()
            .map(|r| r.file)
            .collect();
        row_files.sort();
        assert!(pngs.len() >= 3);
        assert_eq!(row_files, pngs);
        assert_eq!(first.counts.crops_written, pngs.len());

        let measurements = std::fs::read_to_string(run_dir.join("scripted_measurements.csv")).unwrap();
        assert_eq!(measurements.lines().count(), pngs.len() + 1);

        let second = segment_scripted(six_frames(), &config, &output);
        assert_eq!(second.counts, first.counts);
        assert_eq!(png_files(&run_dir), pngs);

        let run = run_context::load_run(&output, "scripted").unwrap().unwrap();
        assert!(run.is_complete());

        std::fs::remove_dir_all(&output).ok();
    }

    #[test]
    fn test_decode_error_marks_video_failed() {
        let output = scratch_dir("orchestrator-truncated");
        let script = vec![
            Ok(particle_frame(1)),
            Ok(particle_frame(2)),
            Err(anyhow!("corrupt packet")),
            Ok(particle_frame(3)),
        ];

        let report = segment_scripted(script, &small_pipeline_config(), &output);
        assert!(report.is_failed());
        assert_eq!(report.counts.frames_read, 2);

        let run = run_context::load_run(&output, "scripted").unwrap().unwrap();
        let summary = run.summary.as_ref().unwrap();
        assert!(summary.decode_error.as_deref().unwrap().contains("corrupt packet"));
        assert!(!run.is_complete());
        let marker = std::fs::read_to_string(output.join("scripted_error.txt")).unwrap();
        assert!(marker.contains("after frame 2"));

        std::fs::remove_dir_all(&output).ok();
    }

    #[test]
    fn test_duplicate_video_ids_are_rejected() {
        let input = scratch_dir("orchestrator-dup-in");
        let output = scratch_dir("orchestrator-dup-out");
        let videos = vec![input.join("transect1/cam0.avi"), input.join("transect2/cam0.avi")];
        for video in &videos {
            std::fs::create_dir_all(video.parent().unwrap()).unwrap();
            std::fs::write(video, b"not a video").unwrap();
        }
        std::fs::create_dir_all(output.join("cam0")).unwrap();
        std::fs::write(output.join("cam0/cam0_000001_000.png"), b"earlier").unwrap();

        let reports = segment_videos(
            &videos,
            Arc::new(PipelineConfig::default()),
            &output,
            &CancelToken::new(),
            false,
        );

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_failed() && r.video_id == "cam0"));
        assert!(output.join("cam0/cam0_000001_000.png").exists());
        assert!(!output.join("cam0_error.txt").exists());
        assert!(videos.iter().all(|v| v.exists()));

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }

    #[test]
    fn test_completed_video_is_skipped_unless_forced() {
        let input = scratch_dir("orchestrator-resume-in");
        let output = scratch_dir("orchestrator-resume-out");
        let video = input.join("scripted.avi");
        std::fs::write(&video, b"not a video").unwrap();

        // A finished run for the same id, produced from a scripted source
        let done = segment_scripted(six_frames(), &small_pipeline_config(), &output);
        let config = Arc::new(PipelineConfig::default());

        let reports = segment_videos(&[video.clone()], config.clone(), &output, &CancelToken::new(), false);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].skipped);
        assert!(!reports[0].is_failed());
        assert_eq!(reports[0].counts, done.counts);
        assert!(!output.join("scripted_error.txt").exists());

        let reports = segment_videos(&[video], config, &output, &CancelToken::new(), true);
        assert!(!reports[0].skipped);
        assert!(reports[0].is_failed());
        assert!(output.join("scripted_error.txt").exists());

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }
}
