// tracker.rs — Feature detection and propagation behind one trait.
//
// The odometry engine only needs two things from its front end: fresh
// points on an image, and the survivors of those points in the next
// image. `FeatureTracker` is that seam. `KltFeatureTracker` is the stock
// implementation (corner detector + pyramidal KLT); tests plug in
// synthetic trackers that project known 3D points instead.
//
// Tracking output is a single ordered list of `Correspondence` records,
// one per surviving point, so previous/current positions can never drift
// out of step the way two parallel arrays filtered separately can.

use nalgebra::Point2;

use crate::corners::{CornerDetector, DetectorConfig};
use crate::image::Image;
use crate::klt::{KltTracker, TrackStatus, TrackerConfig};
use crate::pyramid::Pyramid;

/// Sigma of the Gaussian used between pyramid levels.
const PYRAMID_SIGMA: f32 = 1.0;

/// A point seen in two consecutive frames.
///
/// Pixel coordinates when produced by a tracker; the pose estimator
/// re-expresses them in normalized camera coordinates internally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub prev: Point2<f64>,
    pub curr: Point2<f64>,
}

impl Correspondence {
    pub fn new(prev: Point2<f64>, curr: Point2<f64>) -> Self {
        Correspondence { prev, curr }
    }
}

/// Detects salient points and follows them into the next image.
pub trait FeatureTracker {
    /// Detect points in a grayscale image. Must be deterministic for the
    /// same image.
    fn detect(&self, gray: &Image<u8>) -> Vec<Point2<f64>>;

    /// Follow `prev_points` from `prev` into `curr`.
    ///
    /// Points that fail to track are dropped. The result is an
    /// order-preserving sub-selection of the input, so its length never
    /// exceeds `prev_points.len()`.
    fn track(&self, prev: &Image<u8>, curr: &Image<u8>, prev_points: &[Point2<f64>]) -> Vec<Correspondence>;
}

/// Corner detection plus pyramidal Lucas-Kanade.
pub struct KltFeatureTracker {
    detector: CornerDetector,
    klt: KltTracker,
}

impl KltFeatureTracker {
    pub fn new(detector: DetectorConfig, tracker: TrackerConfig) -> Self {
        KltFeatureTracker {
            detector: CornerDetector::new(detector),
            klt: KltTracker::new(tracker),
        }
    }

    pub fn detector(&self) -> &CornerDetector {
        &self.detector
    }
}

impl FeatureTracker for KltFeatureTracker {
    fn detect(&self, gray: &Image<u8>) -> Vec<Point2<f64>> {
        self.detector
            .detect(gray)
            .into_iter()
            .map(|c| Point2::new(c.x as f64, c.y as f64))
            .collect()
    }

    fn track(&self, prev: &Image<u8>, curr: &Image<u8>, prev_points: &[Point2<f64>]) -> Vec<Correspondence> {
        if prev_points.is_empty() {
            return Vec::new();
        }
        let levels = self.klt.config().pyramid_levels.max(1);
        let prev_pyr = Pyramid::build(prev, levels, PYRAMID_SIGMA);
        let curr_pyr = Pyramid::build(curr, levels, PYRAMID_SIGMA);

        let seeds: Vec<Point2<f32>> = prev_points.iter().map(|p| p.cast::<f32>()).collect();
        let tracked = self.klt.track(&prev_pyr, &curr_pyr, &seeds);

        prev_points
            .iter()
            .zip(tracked)
            .filter(|(_, t)| t.status == TrackStatus::Tracked)
            .map(|(p, t)| Correspondence::new(*p, t.position.cast::<f64>()))
            .collect()
    }
}
