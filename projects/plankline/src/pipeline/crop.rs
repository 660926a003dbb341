use crate::error::SegmentError;
use crate::pipeline::measure::ParticleMeasurer;
use crate::pipeline::types::{FrameOutcome, Region};
use crate::run_artifacts::{
    blank_filename, crop_filename, measurement_filename, stats_filename, BlankRecord,
    MeasurementRecord, StatRecord, BLANK_HEADER, MEASUREMENT_HEADER, STATS_HEADER,
};
use image::{imageops, GrayImage, ImageFormat};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persists the crops of one video and appends their measurement rows.
///
/// Shared by every frame worker of the video. Rows go through append-mode
/// handles, one `write` per frame, so concurrent workers never tear or
/// reorder a row and no lock is taken. A frame's output is all or nothing:
/// if any crop or its rows cannot be written, the frame's crops are removed.
pub struct CropWriter {
    output_dir: PathBuf,
    video_id: String,
    stats_path: PathBuf,
    stats: File,
    blanks_path: PathBuf,
    blanks: File,
    measurements: Option<MeasurementSink>,
}

struct MeasurementSink {
    measurer: ParticleMeasurer,
    path: PathBuf,
    file: File,
}

impl CropWriter {
    /// Creates (or truncates) the statistics and blank-frame files and writes their headers.
    pub fn create(output_dir: &Path, video_id: &str) -> Result<Self, SegmentError> {
        fs::create_dir_all(output_dir)
            .map_err(|e| SegmentError::write_failure(output_dir, e))?;

        let stats_path = output_dir.join(stats_filename(video_id));
        let blanks_path = output_dir.join(blank_filename(video_id));
        let stats = open_with_header(&stats_path, STATS_HEADER)?;
        let blanks = open_with_header(&blanks_path, BLANK_HEADER)?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            video_id: video_id.to_string(),
            stats_path,
            stats,
            blanks_path,
            blanks,
            measurements: None,
        })
    }

    /// Also measure every crop into `<video_id>_measurements.csv`.
    pub fn with_measurer(mut self, measurer: ParticleMeasurer) -> Result<Self, SegmentError> {
        let path = self.output_dir.join(measurement_filename(&self.video_id));
        let file = open_with_header(&path, MEASUREMENT_HEADER)?;
        self.measurements = Some(MeasurementSink {
            measurer,
            path,
            file,
        });
        Ok(self)
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    pub fn blanks_path(&self) -> &Path {
        &self.blanks_path
    }

    pub fn measurements_path(&self) -> Option<&Path> {
        self.measurements.as_ref().map(|m| m.path.as_path())
    }

    /// Writes one crop per region (crop_index follows slice order) or a blank marker.
    pub fn write_frame(
        &self,
        frame_index: usize,
        pixels: &GrayImage,
        regions: &[Region],
    ) -> Result<FrameOutcome, SegmentError> {
        if regions.is_empty() {
            let record = BlankRecord {
                video: self.video_id.clone(),
                frame: frame_index,
            };
            let row = encode_rows(&self.blanks_path, &[record])?;
            append_rows(&self.blanks, &self.blanks_path, &row)?;
            return Ok(FrameOutcome::Blank);
        }

        let mut saved = Vec::with_capacity(regions.len());
        let measured = match self.write_crops(frame_index, pixels, regions, &mut saved) {
            Ok(measured) => measured,
            Err(e) => {
                for path in &saved {
                    let _ = fs::remove_file(path);
                }
                return Err(e);
            }
        };

        // Stats rows are committed; a missing measurement row is not worth losing the crops
        if let Some(sink) = &self.measurements {
            let appended = encode_rows(&sink.path, &measured)
                .and_then(|rows| append_rows(&sink.file, &sink.path, &rows));
            if let Err(e) = appended {
                tracing::warn!(
                    "{} frame {}: measurements not recorded: {}",
                    self.video_id,
                    frame_index,
                    e
                );
            }
        }

        Ok(FrameOutcome::Crops(regions.len()))
    }

    /// Saves every crop, then appends all of the frame's stat rows in one write.
    /// Paths of the crops saved so far are pushed to `saved`.
    fn write_crops(
        &self,
        frame_index: usize,
        pixels: &GrayImage,
        regions: &[Region],
        saved: &mut Vec<PathBuf>,
    ) -> Result<Vec<MeasurementRecord>, SegmentError> {
        let mut records = Vec::with_capacity(regions.len());
        let mut measured = Vec::new();

        for (crop_index, region) in regions.iter().enumerate() {
            let filename = crop_filename(&self.video_id, frame_index, crop_index);
            let path = self.output_dir.join(&filename);

            let crop = imageops::crop_imm(pixels, region.x, region.y, region.width, region.height)
                .to_image();
            crop.save_with_format(&path, ImageFormat::Png)
                .map_err(|e| SegmentError::write_failure(&path, e))?;
            saved.push(path);

            if let Some(sink) = &self.measurements {
                measured.push(sink.measurer.record(&filename, &crop));
            }
            records.push(StatRecord {
                file: filename,
                frame: frame_index,
                crop: crop_index,
                x: region.x,
                y: region.y,
                w: crop.width(),
                h: crop.height(),
                area: region.area,
            });
        }

        let rows = encode_rows(&self.stats_path, &records)?;
        append_rows(&self.stats, &self.stats_path, &rows)?;
        Ok(measured)
    }
}

fn open_with_header(path: &Path, header: &str) -> Result<File, SegmentError> {
    fs::write(path, header).map_err(|e| SegmentError::write_failure(path, e))?;
    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| SegmentError::write_failure(path, e))
}

/// Serializes CSV rows (no header) into one in-memory buffer.
fn encode_rows<T: Serialize>(path: &Path, records: &[T]) -> Result<Vec<u8>, SegmentError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(96 * records.len()));
    for record in records {
        writer
            .serialize(record)
            .map_err(|e| SegmentError::write_failure(path, e))?;
    }
    writer
        .into_inner()
        .map_err(|e| SegmentError::write_failure(path, e.error()))
}

/// Hands the rows to the kernel in a single append.
fn append_rows(file: &File, path: &Path, rows: &[u8]) -> Result<(), SegmentError> {
    let mut handle = file;
    let written = handle
        .write(rows)
        .map_err(|e| SegmentError::write_failure(path, e))?;
    if written != rows.len() {
        return Err(SegmentError::write_failure(
            path,
            format!("short append ({} of {} bytes)", written, rows.len()),
        ));
    }
    Ok(())
}
