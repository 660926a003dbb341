// Run artifact struct definitions
//
// Records persisted inside a video's output directory: one CSV row per
// surviving crop, one morphometry row per crop, one row per blank frame,
// and the final run summary.

use crate::pipeline::types::{FrameCounts, VideoState};
use serde::{Deserialize, Serialize, Serializer};

pub const STATS_HEADER: &str = "file,frame,crop,x,y,w,h,area\n";
pub const BLANK_HEADER: &str = "video,frame\n";
pub const MEASUREMENT_HEADER: &str = "file,area,major,minor,perimeter,orientation,euler_number\n";

/// One surviving detection. `file` is the crop filename, which embeds the video id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatRecord {
    pub file: String,
    pub frame: usize,
    pub crop: usize,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub area: u64,
}

/// Marker for a frame that produced no surviving regions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlankRecord {
    pub video: String,
    pub frame: usize,
}

/// Shape of the largest dark particle inside one crop. Crops where nothing
/// survives thresholding are written with `NA` in every measured column.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub file: String,
    #[serde(serialize_with = "na_or")]
    pub area: Option<u64>,
    #[serde(serialize_with = "na_or")]
    pub major: Option<f64>,
    #[serde(serialize_with = "na_or")]
    pub minor: Option<f64>,
    #[serde(serialize_with = "na_or")]
    pub perimeter: Option<f64>,
    #[serde(serialize_with = "na_or")]
    pub orientation: Option<f64>,
    #[serde(serialize_with = "na_or")]
    pub euler_number: Option<i64>,
}

fn na_or<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: Serializer,
{
    match value {
        Some(v) => v.serialize(serializer),
        None => serializer.serialize_str("NA"),
    }
}

/// Written to metadata.json once a video reaches a terminal state.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunSummary {
    pub state: VideoState,
    pub counts: FrameCounts,
    pub elapsed_secs: f64,
    /// Set when the run was interrupted before the source was exhausted
    #[serde(default)]
    pub cancelled: bool,
    /// Decoder failure that cut the video short after its first frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
}

impl RunSummary {
    /// A run whose output covers the whole source video.
    pub fn is_complete(&self) -> bool {
        self.state == VideoState::Completed && !self.cancelled && self.decode_error.is_none()
    }
}

/// Deterministic crop filename for (video, frame, crop).
pub fn crop_filename(video_id: &str, frame_index: usize, crop_index: usize) -> String {
    format!("{}_{:06}_{:03}.png", video_id, frame_index, crop_index)
}

pub fn stats_filename(video_id: &str) -> String {
    format!("{}.csv", video_id)
}

pub fn blank_filename(video_id: &str) -> String {
    format!("{}_blank.csv", video_id)
}

pub fn measurement_filename(video_id: &str) -> String {
    format!("{}_measurements.csv", video_id)
}
