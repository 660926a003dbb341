use crate::pipeline::types::Region;

/// Removes redundant overlapping detections.
///
/// Overlap is `intersection / max(area_a, area_b)`, not IoU: a small box mostly
/// covered by a much larger one is suppressed even though their IoU is low.
#[derive(Debug, Clone, Copy)]
pub struct OverlapSuppressor {
    threshold: f64,
}

impl OverlapSuppressor {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Returns the surviving regions in their input order.
    ///
    /// For every pair still alive whose ratio exceeds the threshold the smaller
    /// region is discarded; on equal areas the one seen first survives.
    pub fn suppress(&self, regions: Vec<Region>) -> Vec<Region> {
        if regions.len() < 2 {
            return regions.into_iter().filter(|r| r.area > 0).collect();
        }

        let mut discarded: Vec<bool> = regions.iter().map(|r| r.area == 0).collect();

        for i in 0..regions.len() {
            if discarded[i] {
                continue;
            }
            for j in (i + 1)..regions.len() {
                if discarded[j] {
                    continue;
                }

                if overlap_ratio(&regions[i], &regions[j]) > self.threshold {
                    if regions[j].area > regions[i].area {
                        discarded[i] = true;
                        break;
                    }
                    discarded[j] = true;
                }
            }
        }

        regions
            .into_iter()
            .zip(discarded)
            .filter_map(|(region, gone)| (!gone).then_some(region))
            .collect()
    }
}

/// Intersection area divided by the larger of the two areas.
pub fn overlap_ratio(a: &Region, b: &Region) -> f64 {
    let larger = a.area.max(b.area);
    if larger == 0 {
        return 0.0;
    }
    a.intersection_area(b) as f64 / larger as f64
}
