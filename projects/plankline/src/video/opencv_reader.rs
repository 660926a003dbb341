use super::VideoReader;
use anyhow::{anyhow, bail, Result};
use image::GrayImage;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
    videoio::{VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT},
};

pub struct OpencvReader {
    capture: VideoCapture,
    source_fps: f64,
    total_frames: usize,
}

impl OpencvReader {
    pub fn new(path: &str) -> Result<Self> {
        let capture = VideoCapture::from_file(path, CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path));
        }

        let mut fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!("OpencvReader: Failed to get FPS from metadata, falling back to 30.0");
            fps = 30.0;
        }
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;

        tracing::info!(
            "OpencvReader: opened {}, duration={:.2}s, fps={:.2}, stream_frames={}",
            path,
            raw_count as f64 / fps,
            fps,
            raw_count
        );

        Ok(Self {
            capture,
            source_fps: fps,
            total_frames: raw_count,
        })
    }
}

impl VideoReader for OpencvReader {
    fn frame_count(&self) -> usize {
        self.total_frames
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn read_frame(&mut self) -> Result<Option<GrayImage>> {
        let mut frame = Mat::default();
        let success = self.capture.read(&mut frame)?;
        if !success || frame.empty() {
            return Ok(None);
        }

        mat_to_gray(&frame).map(Some)
    }
}

/// Convert an 8-bit OpenCV Mat (gray, BGR or BGRA) into an owned grayscale image.
pub fn mat_to_gray(mat: &Mat) -> Result<GrayImage> {
    if mat.depth() != core::CV_8U {
        bail!("Unsupported Mat depth {}", mat.depth());
    }

    let gray = match mat.channels() {
        1 => mat.try_clone()?,
        3 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(mat, &mut gray, imgproc::COLOR_BGR2GRAY)?;
            gray
        }
        4 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(mat, &mut gray, imgproc::COLOR_BGRA2GRAY)?;
            gray
        }
        n => bail!("Unsupported channel count {}", n),
    };

    // try_clone always yields a continuous buffer
    let gray = if gray.is_continuous() {
        gray
    } else {
        gray.try_clone()?
    };

    let size = gray.size()?;
    let data = gray.data_bytes()?.to_vec();
    GrayImage::from_vec(size.width as u32, size.height as u32, data)
        .ok_or_else(|| anyhow!("Failed to create GrayImage from Mat data"))
}
