use image::GrayImage;

/// Removes fixed illumination gradients from line-scan frames.
///
/// Each column's illumination floor is estimated as a low quantile of its
/// intensities (plus one, so a black column never divides by zero); every
/// pixel is divided by its column floor, scaled to 0..=255 and clipped.
#[derive(Debug, Clone, Copy)]
pub struct FlatFieldNormalizer {
    quantile: f64,
}

impl FlatFieldNormalizer {
    pub fn new(quantile: f64) -> Self {
        Self {
            quantile: quantile.clamp(0.0, 1.0),
        }
    }

    pub fn normalize(&self, frame: &GrayImage) -> GrayImage {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return frame.clone();
        }

        let floors: Vec<f64> = (0..width)
            .map(|x| column_quantile(frame, x, self.quantile) + 1.0)
            .collect();

        GrayImage::from_fn(width, height, |x, y| {
            let value = frame.get_pixel(x, y).0[0] as f64;
            let scaled = value / floors[x as usize] * 255.0;
            image::Luma([scaled.clamp(0.0, 255.0) as u8])
        })
    }
}

/// Quantile of one column with linear interpolation between order statistics.
fn column_quantile(frame: &GrayImage, x: u32, q: f64) -> f64 {
    let height = frame.height() as usize;
    let mut histogram = [0usize; 256];
    for y in 0..frame.height() {
        histogram[frame.get_pixel(x, y).0[0] as usize] += 1;
    }

    let position = q * (height - 1) as f64;
    let lower_rank = position.floor() as usize;
    let upper_rank = position.ceil() as usize;
    let fraction = position - lower_rank as f64;

    let lower = nth_smallest(&histogram, lower_rank) as f64;
    let upper = nth_smallest(&histogram, upper_rank) as f64;
    lower + (upper - lower) * fraction
}

fn nth_smallest(histogram: &[usize; 256], rank: usize) -> u8 {
    let mut seen = 0;
    for (value, &count) in histogram.iter().enumerate() {
        seen += count;
        if seen > rank {
            return value as u8;
        }
    }
    u8::MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_column_quantile_interpolates() {
        // Column values 0, 10, 20, ..., 90
        let frame = GrayImage::from_fn(1, 10, |_, y| Luma([(y * 10) as u8]));
        assert_eq!(column_quantile(&frame, 0, 0.0), 0.0);
        assert_eq!(column_quantile(&frame, 0, 1.0), 90.0);
        // position 0.5 * 9 = 4.5 -> halfway between 40 and 50
        assert!((column_quantile(&frame, 0, 0.5) - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_removes_column_gradient() {
        // Background brightness ramps across columns; a dark particle sits in the middle.
        let frame = GrayImage::from_fn(8, 50, |x, y| {
            if (20..25).contains(&y) && x == 4 {
                Luma([10])
            } else {
                Luma([40 + (x as u8) * 20])
            }
        });
        let out = FlatFieldNormalizer::new(0.5).normalize(&frame);
        assert_eq!(out.dimensions(), frame.dimensions());

        // Background of every column maps to the same value regardless of its raw brightness
        let first = out.get_pixel(0, 0).0[0];
        for x in 0..8 {
            let v = out.get_pixel(x, 0).0[0];
            assert!((v as i32 - first as i32).abs() <= 6, "column {} -> {}", x, v);
        }
        // The particle stays darker than its column background
        assert!(out.get_pixel(4, 22).0[0] < out.get_pixel(4, 0).0[0]);
    }

    #[test]
    fn test_is_deterministic() {
        let frame = GrayImage::from_fn(16, 16, |x, y| Luma([((x * 31 + y * 17) % 256) as u8]));
        let normalizer = FlatFieldNormalizer::new(0.02);
        let a = normalizer.normalize(&frame);
        let b = normalizer.normalize(&frame);
        assert_eq!(a, b);
    }

    #[test]
    fn test_black_frame_does_not_divide_by_zero() {
        let frame = GrayImage::new(4, 4);
        let out = FlatFieldNormalizer::new(0.02).normalize(&frame);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }
}
