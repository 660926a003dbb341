// Reader stage: turns a decoder into a frame sequence and feeds the bounded queue

use crate::cancel::CancelToken;
use crate::error::SegmentError;
use crate::pipeline::types::{Frame, ProcessingState};
use crate::video::{open_reader, VideoReader};
use crossbeam::channel::Sender;
use image::GrayImage;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Lazy, forward-only sequence of decoded frames, numbered from 1.
///
/// Opening decodes the first frame up front, so an unreadable container is
/// reported as `CorruptInput` before any pipeline work starts. A decode error
/// later on ends the sequence and is kept for `decode_error`.
pub struct FrameSource {
    video_id: String,
    reader: Box<dyn VideoReader>,
    primed: Option<GrayImage>,
    next_index: usize,
    finished: bool,
    decode_error: Option<String>,
}

impl FrameSource {
    pub fn open(path: &Path, video_id: &str, backend: &str) -> Result<Self, SegmentError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| corrupt(path, "path is not valid UTF-8"))?;
        let reader = open_reader(path_str, backend).map_err(|e| corrupt(path, format!("{:#}", e)))?;
        Self::from_reader(reader, path, video_id)
    }

    pub fn from_reader(
        mut reader: Box<dyn VideoReader>,
        path: &Path,
        video_id: &str,
    ) -> Result<Self, SegmentError> {
        let first = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(corrupt(path, "container holds no decodable frames")),
            Err(e) => return Err(corrupt(path, format!("{:#}", e))),
        };

        Ok(Self {
            video_id: video_id.to_string(),
            reader,
            primed: Some(first),
            next_index: 1,
            finished: false,
            decode_error: None,
        })
    }

    /// Frame count reported by the container (an estimate for some codecs).
    pub fn expected_frames(&self) -> usize {
        self.reader.frame_count()
    }

    pub fn source_fps(&self) -> f64 {
        self.reader.source_fps()
    }

    /// Why the stream ended before the decoder reported end of file, if it did.
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    fn emit(&mut self, pixels: GrayImage) -> Frame {
        let frame = Frame {
            video_id: self.video_id.clone(),
            frame_index: self.next_index,
            pixels,
        };
        self.next_index += 1;
        frame
    }
}

impl Iterator for FrameSource {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if let Some(pixels) = self.primed.take() {
            return Some(self.emit(pixels));
        }
        if self.finished {
            return None;
        }

        match self.reader.read_frame() {
            Ok(Some(pixels)) => Some(self.emit(pixels)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                let reason = format!("decode failed after frame {}: {:#}", self.next_index - 1, e);
                tracing::warn!("{}: {}, ending stream", self.video_id, reason);
                self.decode_error = Some(reason);
                self.finished = true;
                None
            }
        }
    }
}

fn corrupt(path: &Path, reason: impl ToString) -> SegmentError {
    SegmentError::CorruptInput {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Producer loop. Blocks on `send` while the queue is full; stops early on
/// cancellation or when every receiver is gone. Returns the number of frames sent.
pub fn read_worker<I>(
    frames: I,
    tx: Sender<Frame>,
    state: &ProcessingState,
    cancel: &CancelToken,
) -> usize
where
    I: Iterator<Item = Frame>,
{
    let mut frames = frames;
    let mut sent = 0;

    loop {
        if cancel.is_cancelled() {
            tracing::info!("{}: reader stopping on cancellation", state.video_id);
            break;
        }

        let start_inst = Instant::now();
        let frame = match frames.next() {
            Some(frame) => frame,
            None => break,
        };
        let duration_ms = start_inst.elapsed().as_secs_f64() * 1000.0;
        state.frames_read.fetch_add(1, Ordering::Relaxed);
        state.update_stage("reader", 1, duration_ms);

        if tx.send(frame).is_err() {
            break; // Receivers closed
        }
        sent += 1;
    }

    sent
}
