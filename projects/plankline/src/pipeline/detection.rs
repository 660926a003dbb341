use crate::config::SegmentationConfig;
use crate::pipeline::types::Region;
use image::GrayImage;
use opencv::core::{self, Mat, Scalar};
use opencv::features2d::MSER;
use opencv::prelude::*;

// OpenCV defaults for the MSER parameters that are not exposed in the config.
const MAX_EVOLUTION: i32 = 200;
const AREA_THRESHOLD: f64 = 1.01;
const MIN_MARGIN: f64 = 0.003;
const EDGE_BLUR_SIZE: i32 = 5;

#[derive(Debug, Clone)]
pub struct DetectionParams {
    pub delta: i32,
    pub min_area: i32,
    pub max_area: i32,
    pub max_variation: f64,
    pub min_diversity: f64,
    pub signal_to_noise: Option<f64>,
}

impl From<&SegmentationConfig> for DetectionParams {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            delta: config.delta,
            min_area: config.min_area,
            max_area: config.max_area,
            max_variation: config.max_variation,
            min_diversity: config.min_diversity,
            signal_to_noise: config.signal_to_noise,
        }
    }
}

/// Maximally-stable-extremal-region blob detector over normalized frames.
///
/// Returns every MSER bounding box sorted by position, so identical input
/// always yields the identical list. Nested extremal regions often share a
/// box; deciding between them is left to the overlap suppressor.
#[derive(Debug, Clone)]
pub struct RegionDetector {
    params: DetectionParams,
}

impl RegionDetector {
    pub fn new(params: DetectionParams) -> Self {
        Self { params }
    }

    pub fn detect(&self, frame: &GrayImage) -> opencv::Result<Vec<Region>> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let mat = gray_to_mat(frame)?;
        let mut mser = MSER::create(
            self.params.delta,
            self.params.min_area,
            self.params.max_area,
            self.params.max_variation,
            self.params.min_diversity,
            MAX_EVOLUTION,
            AREA_THRESHOLD,
            MIN_MARGIN,
            EDGE_BLUR_SIZE,
        )?;

        let mut msers = core::Vector::<core::Vector<core::Point>>::new();
        let mut bboxes = core::Vector::<core::Rect>::new();
        mser.detect_regions(&mat, &mut msers, &mut bboxes)?;

        let mut regions: Vec<Region> = bboxes
            .iter()
            .filter_map(|rect| clamp_rect(rect, width, height))
            .collect();
        regions.sort_by_key(|r| (r.y, r.x, r.height, r.width));

        if let Some(snr) = self.params.signal_to_noise {
            let noise = FrameNoise::measure(frame);
            regions.retain(|r| noise.passes(darkest_in(frame, r), snr));
        }

        tracing::trace!("MSER produced {} candidate regions", regions.len());
        Ok(regions)
    }
}

fn clamp_rect(rect: core::Rect, width: u32, height: u32) -> Option<Region> {
    let x = rect.x.clamp(0, width as i32);
    let y = rect.y.clamp(0, height as i32);
    let w = (rect.x + rect.width).clamp(0, width as i32) - x;
    let h = (rect.y + rect.height).clamp(0, height as i32) - y;
    if w <= 0 || h <= 0 {
        return None;
    }
    Some(Region::new(x as u32, y as u32, w as u32, h as u32))
}

/// Copy a grayscale image into a single-channel 8-bit Mat.
pub fn gray_to_mat(frame: &GrayImage) -> opencv::Result<Mat> {
    let (width, height) = frame.dimensions();
    let mut mat =
        Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC1, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(frame.as_raw());
    Ok(mat)
}

/// Background level and spread of a frame, used by the signal-to-noise gate.
#[derive(Debug, Clone, Copy)]
struct FrameNoise {
    mean: f64,
    stddev: f64,
}

impl FrameNoise {
    fn measure(frame: &GrayImage) -> Self {
        let n = (frame.width() as f64) * (frame.height() as f64);
        let (sum, sum_sq) = frame.pixels().fold((0.0, 0.0), |(s, sq), p| {
            let v = p.0[0] as f64;
            (s + v, sq + v * v)
        });
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        Self {
            mean,
            stddev: variance.sqrt(),
        }
    }

    /// Particles are darker than the background; contrast is measured from the darkest pixel.
    fn passes(&self, darkest: u8, snr: f64) -> bool {
        self.mean - darkest as f64 >= snr * self.stddev
    }
}

fn darkest_in(frame: &GrayImage, region: &Region) -> u8 {
    let mut darkest = u8::MAX;
    for y in region.y..region.bottom() {
        for x in region.x..region.right() {
            darkest = darkest.min(frame.get_pixel(x, y).0[0]);
        }
    }
    darkest
}
