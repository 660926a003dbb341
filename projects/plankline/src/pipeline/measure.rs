// Particle morphometry for a single crop
//
// The crop is smoothed with a grayscale opening and a light erosion, then
// thresholded so that dark material becomes foreground. The largest
// 8-connected particle is measured with the moment-based definitions used by
// region-property tools (ellipse axes, orientation, weighted perimeter and
// Euler number).

use crate::run_artifacts::MeasurementRecord;
use image::{GrayImage, Luma};
use imageproc::morphology::{grayscale_erode, grayscale_open, Mask};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::f64::consts::{FRAC_PI_4, SQRT_2};

/// Measured shape of the dominant particle in a crop.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleShape {
    pub area: u64,
    pub major_axis: f64,
    pub minor_axis: f64,
    pub perimeter: f64,
    /// Radians in (-pi/2, pi/2], between the row axis and the major axis
    pub orientation: f64,
    pub euler_number: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ParticleMeasurer {
    threshold: u8,
    open_radius: u8,
}

impl ParticleMeasurer {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            open_radius: 3,
        }
    }

    /// Shape of the largest dark particle, or `None` when nothing is darker
    /// than the threshold after smoothing.
    pub fn measure(&self, crop: &GrayImage) -> Option<ParticleShape> {
        let (width, height) = crop.dimensions();
        if width == 0 || height == 0 {
            return None;
        }

        let opened = grayscale_open(crop, &Mask::disk(self.open_radius));
        let eroded = grayscale_erode(&opened, &Mask::square(1));
        let foreground = GrayImage::from_fn(width, height, |x, y| {
            if eroded.get_pixel(x, y).0[0] < self.threshold {
                Luma([255])
            } else {
                Luma([0])
            }
        });

        let labels = connected_components(&foreground, Connectivity::Eight, Luma([0u8]));
        let largest = largest_label(&labels)?;
        let mask: Vec<bool> = labels.pixels().map(|p| p.0[0] == largest).collect();
        Some(shape_of(&mask, width as usize, height as usize))
    }

    /// Measurement row for a crop, `NA` columns when no particle was found.
    pub fn record(&self, file: &str, crop: &GrayImage) -> MeasurementRecord {
        match self.measure(crop) {
            Some(shape) => MeasurementRecord {
                file: file.to_string(),
                area: Some(shape.area),
                major: Some(round2(shape.major_axis)),
                minor: Some(round2(shape.minor_axis)),
                perimeter: Some(round2(shape.perimeter)),
                orientation: Some(round2(shape.orientation)),
                euler_number: Some(shape.euler_number),
            },
            None => MeasurementRecord {
                file: file.to_string(),
                area: None,
                major: None,
                minor: None,
                perimeter: None,
                orientation: None,
                euler_number: None,
            },
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Label with the most pixels; ties go to the lowest label.
fn largest_label(labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>) -> Option<u32> {
    let max_label = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    if max_label == 0 {
        return None;
    }
    let mut sizes = vec![0u64; max_label as usize + 1];
    for p in labels.pixels() {
        sizes[p.0[0] as usize] += 1;
    }
    let mut best = None;
    let mut best_size = 0;
    for label in 1..=max_label {
        if sizes[label as usize] > best_size {
            best_size = sizes[label as usize];
            best = Some(label);
        }
    }
    best
}

fn shape_of(mask: &[bool], width: usize, height: usize) -> ParticleShape {
    let mut area = 0u64;
    let (mut sum_r, mut sum_c) = (0.0, 0.0);
    for y in 0..height {
        for x in 0..width {
            if mask[y * width + x] {
                area += 1;
                sum_r += y as f64;
                sum_c += x as f64;
            }
        }
    }
    let n = area as f64;
    let (mean_r, mean_c) = (sum_r / n, sum_c / n);

    let (mut mu_rr, mut mu_cc, mut mu_rc) = (0.0, 0.0, 0.0);
    for y in 0..height {
        for x in 0..width {
            if mask[y * width + x] {
                let dr = y as f64 - mean_r;
                let dc = x as f64 - mean_c;
                mu_rr += dr * dr;
                mu_cc += dc * dc;
                mu_rc += dr * dc;
            }
        }
    }
    let (var_r, var_c, cov) = (mu_rr / n, mu_cc / n, mu_rc / n);

    // Eigenvalues of the inertia tensor
    let half_trace = (var_r + var_c) / 2.0;
    let spread = (((var_r - var_c) / 2.0).powi(2) + cov * cov).sqrt();
    let l1 = half_trace + spread;
    let l2 = (half_trace - spread).max(0.0);

    let orientation = if var_c == var_r {
        if cov < 0.0 {
            -FRAC_PI_4
        } else {
            FRAC_PI_4
        }
    } else {
        0.5 * (2.0 * cov).atan2(var_r - var_c)
    };

    ParticleShape {
        area,
        major_axis: 4.0 * l1.sqrt(),
        minor_axis: 4.0 * l2.sqrt(),
        perimeter: perimeter(mask, width, height),
        orientation,
        euler_number: 1 - holes(mask, width, height),
    }
}

/// Boundary length with 4-connected boundary pixels weighted by their
/// neighbourhood code (1 for straight runs, sqrt(2) for diagonals, and the
/// mean of both for corners).
fn perimeter(mask: &[bool], width: usize, height: usize) -> f64 {
    let at = |x: isize, y: isize| -> bool {
        x >= 0
            && y >= 0
            && (x as usize) < width
            && (y as usize) < height
            && mask[y as usize * width + x as usize]
    };
    let interior = |x: isize, y: isize| -> bool {
        at(x, y) && at(x - 1, y) && at(x + 1, y) && at(x, y - 1) && at(x, y + 1)
    };
    let border = |x: isize, y: isize| -> bool { at(x, y) && !interior(x, y) };

    let mut total = 0.0;
    for y in 0..height as isize {
        for x in 0..width as isize {
            if !border(x, y) {
                continue;
            }
            let mut code = 1;
            for (dx, dy) in [(-1, 0), (1, 0), (0, -1), (0, 1)] {
                if border(x + dx, y + dy) {
                    code += 2;
                }
            }
            for (dx, dy) in [(-1, -1), (1, -1), (-1, 1), (1, 1)] {
                if border(x + dx, y + dy) {
                    code += 10;
                }
            }
            total += match code {
                5 | 7 | 15 | 17 | 25 | 27 => 1.0,
                21 | 33 => SQRT_2,
                13 | 23 => (1.0 + SQRT_2) / 2.0,
                _ => 0.0,
            };
        }
    }
    total
}

/// Background components (4-connected) enclosed by the particle.
fn holes(mask: &[bool], width: usize, height: usize) -> i64 {
    // One pixel of padding joins every background pixel on the crop edge
    let padded = GrayImage::from_fn(width as u32 + 2, height as u32 + 2, |x, y| {
        let inside = x >= 1 && y >= 1 && (x as usize) <= width && (y as usize) <= height;
        if inside && mask[(y as usize - 1) * width + (x as usize - 1)] {
            Luma([0])
        } else {
            Luma([255])
        }
    });
    let labels = connected_components(&padded, Connectivity::Four, Luma([0u8]));
    let outside = labels.get_pixel(0, 0).0[0];
    let mut seen: Vec<u32> = labels
        .pixels()
        .map(|p| p.0[0])
        .filter(|&l| l != 0 && l != outside)
        .collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(width: u32, height: u32, dark: impl Fn(u32, u32) -> bool) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| if dark(x, y) { Luma([10]) } else { Luma([255]) })
    }

    fn mask_of(width: usize, height: usize, on: impl Fn(usize, usize) -> bool) -> Vec<bool> {
        (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| on(x, y))
            .collect()
    }

    #[test]
    fn test_square_shape() {
        let mask = mask_of(14, 14, |x, y| (2..12).contains(&x) && (2..12).contains(&y));
        let shape = shape_of(&mask, 14, 14);
        assert_eq!(shape.area, 100);
        // Variance of 0..10 is 8.25, so both axes are 4 * sqrt(8.25)
        assert!((shape.major_axis - 4.0 * 8.25f64.sqrt()).abs() < 1e-9);
        assert!((shape.minor_axis - shape.major_axis).abs() < 1e-9);
        assert!((shape.perimeter - 36.0).abs() < 1e-9);
        assert_eq!(shape.euler_number, 1);
    }

    #[test]
    fn test_elongated_shape_orientation() {
        // Wide bar: major axis runs along the columns
        let mask = mask_of(30, 10, |x, y| (2..28).contains(&x) && (4..7).contains(&y));
        let shape = shape_of(&mask, 30, 10);
        assert!(shape.major_axis > shape.minor_axis * 3.0);
        assert!((shape.orientation.abs() - std::f64::consts::FRAC_PI_2).abs() < 1e-9);

        // Tall bar: major axis runs along the rows
        let mask = mask_of(10, 30, |x, y| (4..7).contains(&x) && (2..28).contains(&y));
        assert!(shape_of(&mask, 10, 30).orientation.abs() < 1e-9);
    }

    #[test]
    fn test_ring_has_one_hole() {
        let mask = mask_of(12, 12, |x, y| {
            let ring = (1..11).contains(&x) && (1..11).contains(&y);
            let hole = (4..8).contains(&x) && (4..8).contains(&y);
            ring && !hole
        });
        assert_eq!(shape_of(&mask, 12, 12).euler_number, 0);
    }

    #[test]
    fn test_largest_particle_is_measured() {
        let crop = canvas(60, 40, |x, y| {
            let big = (5..25).contains(&x) && (5..25).contains(&y);
            let small = (40..48).contains(&x) && (10..18).contains(&y);
            big || small
        });
        let shape = ParticleMeasurer::new(253).measure(&crop).unwrap();
        // The final erosion grows dark material by at most one pixel per side
        assert!(shape.area >= 400 && shape.area <= 22 * 22, "area {}", shape.area);
        assert!((shape.major_axis - shape.minor_axis).abs() < 1.0);
    }

    #[test]
    fn test_blank_crop_has_no_particle() {
        let measurer = ParticleMeasurer::new(253);
        let crop = GrayImage::from_pixel(20, 20, Luma([255]));
        assert_eq!(measurer.measure(&crop), None);

        let record = measurer.record("v_000001_000.png", &crop);
        assert_eq!(record.file, "v_000001_000.png");
        assert!(record.area.is_none() && record.euler_number.is_none());
    }

    #[test]
    fn test_thin_gap_is_closed() {
        // A one-pixel bright seam splits the square; smoothing rejoins it
        let crop = canvas(40, 40, |x, y| {
            (10..30).contains(&x) && (10..30).contains(&y) && x != 20
        });
        let shape = ParticleMeasurer::new(253).measure(&crop).unwrap();
        assert!(shape.area >= 400, "area {}", shape.area);
        assert_eq!(shape.euler_number, 1);
    }
}
