use crate::config::SegmentationConfig;
use crate::error::SegmentError;
use crate::pipeline::crop::CropWriter;
use crate::pipeline::detection::{DetectionParams, RegionDetector};
use crate::pipeline::flatfield::FlatFieldNormalizer;
use crate::pipeline::suppression::OverlapSuppressor;
use crate::pipeline::types::{Frame, FrameOutcome, ProcessingState};
use crossbeam::channel::Receiver;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// Per-frame work run by every segment worker. This separates "what to do with
/// a frame" from the queueing and accounting around it.
pub trait FrameProcessor: Sync {
    fn process(&self, frame: &Frame) -> Result<FrameOutcome, SegmentError>;
}

/// Blanket implementation so any shareable closure with the right signature
/// automatically implements FrameProcessor.
impl<F> FrameProcessor for F
where
    F: Fn(&Frame) -> Result<FrameOutcome, SegmentError> + Sync,
{
    fn process(&self, frame: &Frame) -> Result<FrameOutcome, SegmentError> {
        self(frame)
    }
}

/// normalize -> detect -> suppress -> write, for one video.
pub struct SegmentationProcessor {
    normalizer: FlatFieldNormalizer,
    detector: RegionDetector,
    suppressor: OverlapSuppressor,
    writer: CropWriter,
}

impl SegmentationProcessor {
    pub fn new(config: &SegmentationConfig, writer: CropWriter) -> Self {
        Self {
            normalizer: FlatFieldNormalizer::new(config.flatfield_quantile),
            detector: RegionDetector::new(DetectionParams::from(config)),
            suppressor: OverlapSuppressor::new(config.overlap_threshold),
            writer,
        }
    }
}

impl FrameProcessor for SegmentationProcessor {
    fn process(&self, frame: &Frame) -> Result<FrameOutcome, SegmentError> {
        let normalized = self.normalizer.normalize(&frame.pixels);
        let candidates =
            self.detector
                .detect(&normalized)
                .map_err(|source| SegmentError::Detection {
                    frame_index: frame.frame_index,
                    source,
                })?;
        let candidate_count = candidates.len();
        let survivors = self.suppressor.suppress(candidates);
        tracing::debug!(
            "{} frame {}: {} candidates, {} after suppression",
            frame.video_id,
            frame.frame_index,
            candidate_count,
            survivors.len()
        );
        self.writer
            .write_frame(frame.frame_index, &normalized, &survivors)
    }
}

/// Consumes frames until the queue is closed and drained.
///
/// A frame whose processing fails or panics is logged, counted and skipped;
/// the worker carries on with the next frame.
pub fn segment_worker<P>(rx: Receiver<Frame>, processor: &P, state: &ProcessingState)
where
    P: FrameProcessor + ?Sized,
{
    for frame in rx.iter() {
        let start_inst = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| processor.process(&frame)))
            .unwrap_or_else(|payload| {
                Err(SegmentError::WorkerPanic {
                    frame_index: frame.frame_index,
                    message: panic_message(payload.as_ref()),
                })
            });

        match result {
            Ok(outcome) => {
                state.record_outcome(outcome);
                let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;
                state.update_stage("segment", 1, duration_ms);
            }
            Err(e) => {
                tracing::warn!(
                    "{}: skipping frame {}: {}",
                    frame.video_id,
                    frame.frame_index,
                    e
                );
                state.record_failure();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
