// tests/common/mod.rs — Synthetic scene shared by the integration tests.
//
// A `SyntheticScene` holds random 3D points and one camera pose per frame.
// Frame images are tiny constant images whose pixel value is the frame
// index, so `ProjectingTracker` can tell which frame it is looking at and
// answer detection and tracking from exact projections. `render_blobs`
// draws the same scene as real images for the stock KLT front end.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use nalgebra::{Matrix3, Point2, Rotation3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use mono_vo::image::Image;
use mono_vo::{CameraIntrinsics, Correspondence, FeatureTracker, InputImage};

pub const FX: f64 = 500.0;
pub const CX: f64 = 320.0;
pub const CY: f64 = 320.0;

pub fn camera() -> CameraIntrinsics {
    CameraIntrinsics::pinhole(FX, FX, CX, CY).unwrap()
}

pub fn k() -> Matrix3<f64> {
    camera().matrix()
}

/// Camera orientation and center, both in the world frame.
#[derive(Debug, Clone, Copy)]
pub struct CameraPose {
    pub orientation: Rotation3<f64>,
    pub center: Vector3<f64>,
}

impl CameraPose {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        CameraPose {
            orientation: Rotation3::identity(),
            center: Vector3::new(x, y, z),
        }
    }

    pub fn yawed(mut self, angle: f64) -> Self {
        self.orientation = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
        self
    }

    /// Pixel position of a world point, or `None` if it is behind the camera.
    pub fn project(&self, p: &Vector3<f64>) -> Option<Point2<f64>> {
        let c = self.orientation.inverse() * (p - self.center);
        if c.z < 0.5 {
            return None;
        }
        Some(Point2::new(FX * c.x / c.z + CX, FX * c.y / c.z + CY))
    }
}

pub struct SyntheticScene {
    pub points: Vec<Vector3<f64>>,
    pub poses: Vec<CameraPose>,
}

impl SyntheticScene {
    pub fn new(num_points: usize, poses: Vec<CameraPose>, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let points = (0..num_points)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-6.0..10.0),
                    rng.gen_range(-4.0..4.0),
                    rng.gen_range(8.0..20.0),
                )
            })
            .collect();
        SyntheticScene { points, poses }
    }

    /// Points that stay inside a 640×640 view for small camera motions.
    pub fn in_view(num_points: usize, poses: Vec<CameraPose>, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let points = (0..num_points)
            .map(|_| {
                let z = rng.gen_range(8.0..20.0);
                Vector3::new(rng.gen_range(-0.45..0.45) * z, rng.gen_range(-0.45..0.45) * z, z)
            })
            .collect();
        SyntheticScene { points, poses }
    }

    /// Camera moving one unit along +X per frame.
    pub fn sideways(num_frames: usize) -> Self {
        Self::new(200, (0..num_frames).map(|i| CameraPose::at(i as f64, 0.0, 0.0)).collect(), 7)
    }

    /// One constant image per frame, valued with the frame index.
    pub fn images(&self) -> Vec<InputImage> {
        (0..self.poses.len()).map(frame_image).collect()
    }

    pub fn correspondences(&self, from: usize, to: usize) -> Vec<Correspondence> {
        self.points
            .iter()
            .filter_map(|p| Some(Correspondence::new(self.poses[from].project(p)?, self.poses[to].project(p)?)))
            .collect()
    }
}

pub fn frame_image(index: usize) -> InputImage {
    InputImage::from_gray(Image::filled(8, 8, index as u8))
}

fn frame_of(gray: &Image<u8>) -> usize {
    gray.get(0, 0) as usize
}

/// Inputs and outputs of one `FeatureTracker::track` call.
#[derive(Debug, Clone)]
pub struct TrackCall {
    pub from: usize,
    pub to: usize,
    pub input: Vec<Point2<f64>>,
    pub output: Vec<Correspondence>,
}

/// Front end that reads positions straight off the scene geometry.
pub struct ProjectingTracker {
    scene: SyntheticScene,
    /// Frame index → maximum number of points that survive tracking into it.
    survivor_caps: HashMap<usize, usize>,
    /// Frame index → every n-th input point is lost when tracking into it.
    drop_every: HashMap<usize, usize>,
    detect_calls: Cell<usize>,
    calls: RefCell<Vec<TrackCall>>,
}

impl ProjectingTracker {
    pub fn new(scene: SyntheticScene) -> Self {
        ProjectingTracker {
            scene,
            survivor_caps: HashMap::new(),
            drop_every: HashMap::new(),
            detect_calls: Cell::new(0),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn drop_every(mut self, frame: usize, n: usize) -> Self {
        self.drop_every.insert(frame, n);
        self
    }

    pub fn track_calls(&self) -> Vec<TrackCall> {
        self.calls.borrow().clone()
    }

    pub fn cap_survivors(mut self, frame: usize, max: usize) -> Self {
        self.survivor_caps.insert(frame, max);
        self
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.get()
    }

    fn nearest_point(&self, frame: usize, pixel: &Point2<f64>) -> Option<usize> {
        let pose = &self.scene.poses[frame];
        self.scene
            .points
            .iter()
            .enumerate()
            .filter_map(|(i, p)| Some((i, (pose.project(p)? - pixel).norm())))
            .filter(|(_, d)| *d < 1e-6)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }
}

impl FeatureTracker for ProjectingTracker {
    fn detect(&self, gray: &Image<u8>) -> Vec<Point2<f64>> {
        self.detect_calls.set(self.detect_calls.get() + 1);
        let pose = &self.scene.poses[frame_of(gray)];
        self.scene.points.iter().filter_map(|p| pose.project(p)).collect()
    }

    fn track(&self, prev: &Image<u8>, curr: &Image<u8>, prev_points: &[Point2<f64>]) -> Vec<Correspondence> {
        let (from, to) = (frame_of(prev), frame_of(curr));
        let cap = self.survivor_caps.get(&to).copied().unwrap_or(usize::MAX);
        let drop_every = self.drop_every.get(&to).copied().unwrap_or(usize::MAX);
        let output: Vec<Correspondence> = prev_points
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + 1) % drop_every != 0)
            .filter_map(|(_, px)| {
                let idx = self.nearest_point(from, px)?;
                let next = self.scene.poses[to].project(&self.scene.points[idx])?;
                Some(Correspondence::new(*px, next))
            })
            .take(cap)
            .collect();
        self.calls.borrow_mut().push(TrackCall {
            from,
            to,
            input: prev_points.to_vec(),
            output: output.clone(),
        });
        output
    }
}

/// Render every visible scene point of `frame` as a Gaussian blob on a dark
/// background, `width`×`height` pixels.
pub fn render_blobs(scene: &SyntheticScene, frame: usize, width: usize, height: usize) -> Image<u8> {
    const SIGMA: f64 = 2.0;
    const RADIUS: isize = 7;
    let mut img = Image::filled(width, height, 20u8);
    for p in &scene.points {
        let Some(c) = scene.poses[frame].project(p) else { continue };
        let (cx, cy) = (c.x.round() as isize, c.y.round() as isize);
        for y in (cy - RADIUS)..=(cy + RADIUS) {
            for x in (cx - RADIUS)..=(cx + RADIUS) {
                if x < 0 || y < 0 || x >= width as isize || y >= height as isize {
                    continue;
                }
                let d2 = (x as f64 - c.x).powi(2) + (y as f64 - c.y).powi(2);
                let v = (20.0 + 200.0 * (-d2 / (2.0 * SIGMA * SIGMA)).exp()).round() as u8;
                let (ux, uy) = (x as usize, y as usize);
                if v > img.get(ux, uy) {
                    img.set(ux, uy, v);
                }
            }
        }
    }
    img
}
