pub mod ffmpeg_reader;
pub mod opencv_reader;

use anyhow::{anyhow, Result};
use image::GrayImage;

/// A forward-only decoder producing grayscale frames.
pub trait VideoReader: Send {
    /// Frame count reported by the container; may be an estimate or zero.
    fn frame_count(&self) -> usize;
    fn source_fps(&self) -> f64;
    /// Decode the next frame. `Ok(None)` marks the end of the stream.
    fn read_frame(&mut self) -> Result<Option<GrayImage>>;
}

pub fn open_reader(path: &str, backend: &str) -> Result<Box<dyn VideoReader>> {
    match backend {
        "ffmpeg" => Ok(Box::new(ffmpeg_reader::FfmpegReader::new(path)?)),
        "opencv" => Ok(Box::new(opencv_reader::OpencvReader::new(path)?)),
        other => Err(anyhow!("Unsupported video backend: {}", other)),
    }
}
