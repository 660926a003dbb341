use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// A decoded grayscale frame, owned by whichever stage currently holds it.
pub struct Frame {
    pub video_id: String,
    /// 1-based position in the source video
    pub frame_index: usize,
    pub pixels: GrayImage,
}

/// Axis-aligned bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub area: u64,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            area: width as u64 * height as u64,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Area of the overlap between two boxes (0 when disjoint).
    pub fn intersection_area(&self, other: &Region) -> u64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        if x2 <= x1 || y2 <= y1 {
            return 0;
        }
        (x2 - x1) as u64 * (y2 - y1) as u64
    }
}

/// What a worker produced for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Crops(usize),
    Blank,
}

/// Lifecycle of one video through the segmentation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum VideoState {
    Pending,
    Decoding,
    Processing,
    Completed,
    Failed(String),
}

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub ms_per_frame: f64,
}

/// Final per-video counters; persisted into the run's metadata.json.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub frames_read: usize,
    pub frames_processed: usize,
    pub frames_blank: usize,
    pub frames_failed: usize,
    pub crops_written: usize,
}

/// Processing state shared between the producer and the frame workers of one video.
#[derive(Debug)]
pub struct ProcessingState {
    pub video_id: String,
    /// Container-reported frame count, known once the source is opened
    pub expected_frames: AtomicUsize,
    state: RwLock<VideoState>,
    pub frames_read: AtomicUsize,
    pub frames_processed: AtomicUsize,
    pub frames_blank: AtomicUsize,
    pub frames_failed: AtomicUsize,
    pub crops_written: AtomicUsize,
    /// Number of frame workers currently running
    pub active_workers: AtomicUsize,
    /// Progress per stage ("reader", "segment")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(video_id: String, expected_frames: usize) -> Self {
        let mut stages = BTreeMap::new();
        for stage in ["reader", "segment"] {
            stages.insert(
                stage.to_string(),
                StageProgress {
                    current: 0,
                    ms_per_frame: 0.0,
                },
            );
        }

        Self {
            video_id,
            expected_frames: AtomicUsize::new(expected_frames),
            state: RwLock::new(VideoState::Pending),
            frames_read: AtomicUsize::new(0),
            frames_processed: AtomicUsize::new(0),
            frames_blank: AtomicUsize::new(0),
            frames_failed: AtomicUsize::new(0),
            crops_written: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            stages: RwLock::new(stages),
            start_time: Instant::now(),
        }
    }

    pub fn state(&self) -> VideoState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn transition(&self, next: VideoState) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!("{}: {:?} -> {:?}", self.video_id, *state, next);
        *state = next;
    }

    pub fn record_outcome(&self, outcome: FrameOutcome) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            FrameOutcome::Crops(n) => {
                self.crops_written.fetch_add(n, Ordering::Relaxed);
            }
            FrameOutcome::Blank => {
                self.frames_blank.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_failure(&self) {
        self.frames_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_stage(&self, stage: &str, completed: usize, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current += completed;
                // Simple exponential moving average for smoothing durations
                if progress.ms_per_frame == 0.0 {
                    progress.ms_per_frame = ms_per_frame;
                } else {
                    progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
                }
            }
        }
    }

    pub fn counts(&self) -> FrameCounts {
        FrameCounts {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_blank: self.frames_blank.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            crops_written: self.crops_written.load(Ordering::Relaxed),
        }
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let counts = self.counts();
        let effective_fps = if elapsed > 0.0 {
            counts.frames_processed as f64 / elapsed
        } else {
            0.0
        };
        let stages = self
            .stages
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        serde_json::json!({
            "video_id": self.video_id,
            "expected_frames": self.expected_frames.load(Ordering::Relaxed),
            "state": self.state(),
            "counts": counts,
            "stages": stages,
            "active_workers": self.active_workers.load(Ordering::Relaxed),
            "elapsed_secs": elapsed,
            "effective_fps": effective_fps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection_area() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(5, 5, 10, 10);
        assert_eq!(a.intersection_area(&b), 25);
        assert_eq!(b.intersection_area(&a), 25);

        let c = Region::new(10, 0, 5, 5);
        assert_eq!(a.intersection_area(&c), 0); // touching edges
        let inner = Region::new(2, 2, 3, 3);
        assert_eq!(a.intersection_area(&inner), 9);
    }

    #[test]
    fn test_record_outcomes() {
        let state = ProcessingState::new("vid".to_string(), 3);
        state.record_outcome(FrameOutcome::Crops(4));
        state.record_outcome(FrameOutcome::Blank);
        state.record_failure();
        let counts = state.counts();
        assert_eq!(counts.frames_processed, 2);
        assert_eq!(counts.frames_blank, 1);
        assert_eq!(counts.frames_failed, 1);
        assert_eq!(counts.crops_written, 4);
    }

    #[test]
    fn test_state_transitions() {
        let state = ProcessingState::new("vid".to_string(), 0);
        assert_eq!(state.state(), VideoState::Pending);
        state.transition(VideoState::Decoding);
        state.transition(VideoState::Failed("boom".to_string()));
        assert_eq!(state.state(), VideoState::Failed("boom".to_string()));
        let json = state.to_progress_json();
        assert_eq!(json["state"]["state"], "Failed");
    }
}
