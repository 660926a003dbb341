use super::VideoReader;
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::Video as VideoFrame;
use image::GrayImage;
use std::path::Path;

/// Video reader backed by FFmpeg via ffmpeg-next.
/// Decodes on the CPU and converts every frame straight to GRAY8.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<scaling::Context>,
    width: u32,
    height: u32,
    source_fps: f64,
    total_frames: usize,
    packet: ffmpeg_next::codec::packet::Packet,
    /// Whether we've sent EOF to the decoder.
    eof_sent: bool,
}

// SAFETY: an FfmpegReader is owned by the single producer thread of one video
// pipeline; the raw pointers inside ffmpeg-next types are never shared.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &str) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let source = Path::new(path);
        if !source.exists() {
            return Err(anyhow!("Video file not found: {}", path));
        }

        let input_ctx = ffmpeg_next::format::input(&source).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path))?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let source_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 {
            (duration_secs * source_fps).round() as usize
        } else {
            stream_frames
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();

        tracing::info!(
            "FfmpegReader: opened {} ({}x{}), duration={:.2}s, fps={:.2}, estimated_total={}",
            path,
            width,
            height,
            duration_secs,
            source_fps,
            total_frames
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            width,
            height,
            source_fps,
            total_frames,
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pull the next decoded frame, feeding packets as needed.
    /// Returns `Ok(false)` once the decoder is fully drained.
    fn decode_loop(&mut self, target: &mut VideoFrame) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            let mut found_packet = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                // End of input: flush the decoder and drain what it still holds
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn to_gray(&mut self, frame: &VideoFrame) -> Result<GrayImage> {
        if self.scaler.is_none() {
            let scaler = scaling::Context::get(
                frame.format(),
                self.width,
                self.height,
                Pixel::GRAY8,
                self.width,
                self.height,
                scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler unavailable"))?;

        let mut gray_frame = VideoFrame::empty();
        scaler
            .run(frame, &mut gray_frame)
            .context("Scaler failed")?;

        gray_frame_to_image(&gray_frame)
    }
}

/// Copy a GRAY8 ffmpeg frame into an owned image, dropping the row padding.
fn gray_frame_to_image(frame: &VideoFrame) -> Result<GrayImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(width * height);
    for y in 0..height {
        let offset = y * stride;
        pixels.extend_from_slice(&data[offset..offset + width]);
    }

    GrayImage::from_vec(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow!("Failed to create GrayImage from ffmpeg frame"))
}

impl VideoReader for FfmpegReader {
    fn frame_count(&self) -> usize {
        self.total_frames
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn read_frame(&mut self) -> Result<Option<GrayImage>> {
        let mut decoded = VideoFrame::empty();
        if !self.decode_loop(&mut decoded)? {
            return Ok(None);
        }
        self.to_gray(&decoded).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_padding_is_dropped() {
        let (width, height) = (5u32, 3u32);
        let mut frame = VideoFrame::new(Pixel::GRAY8, width, height);
        // Allocation aligns rows, so a 5-pixel row normally carries padding
        let stride = frame.stride(0);
        assert!(stride >= width as usize);

        let data = frame.data_mut(0);
        data.fill(255);
        for y in 0..height as usize {
            for x in 0..width as usize {
                data[y * stride + x] = (x + 10 * y) as u8;
            }
        }

        let image = gray_frame_to_image(&frame).unwrap();
        assert_eq!(image.dimensions(), (width, height));
        assert_eq!(image.get_pixel(0, 0).0[0], 0);
        assert_eq!(image.get_pixel(4, 2).0[0], 24);
        assert!(image.pixels().all(|p| p.0[0] != 255));
    }
}
