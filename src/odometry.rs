// odometry.rs — The frame-to-frame visual odometry loop.
//
// State machine:
//
//   Uninitialized ──initialize()──▶ Tracking ──step(None)──▶ EndOfSequence
//         │                            │  ▲
//         └── failure: unchanged       └──┘ step(Some(image))
//
// Each step:
//   1. If the last frame kept `min_tracked_features` or fewer points,
//      re-detect on its image
//   2. Track the points into the new image
//   3. Estimate the relative pose; on a recoverable failure, re-detect on
//      the previous image and retry once (unless step 1 already did)
//   4. Integrate the pose and append the new frame
//
// A step that still fails leaves history and world pose untouched and
// halts the engine; later steps report `Halted`. An empty input image is
// rejected up front without halting.

use log::{debug, info, warn};

use crate::camera::CameraIntrinsics;
use crate::config::OdometryConfig;
use crate::convert::InputImage;
use crate::error::{ConfigError, InitFailure, OdometryError};
use crate::frame::{Frame, FrameStore};
use crate::image::Image;
use crate::motion::{MotionIntegrator, TrajectoryPoint, WorldPose};
use crate::pose::{PoseEstimator, RelativePose};
use crate::tracker::{Correspondence, FeatureTracker, KltFeatureTracker};

/// Ordered, indexable image sequence.
pub trait ImageSource {
    fn count(&self) -> usize;
    fn get(&self, index: usize) -> Option<InputImage>;
}

impl ImageSource for Vec<InputImage> {
    fn count(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> Option<InputImage> {
        self.as_slice().get(index).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Uninitialized,
    Tracking,
    EndOfSequence,
}

/// Summary of one appended frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub frame_index: usize,
    /// Correspondences that survived tracking.
    pub tracked: usize,
    /// Correspondences consistent with the recovered pose.
    pub inliers: usize,
    /// Whether features were re-detected on the previous frame.
    pub redetected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced(StepReport),
    EndOfSequence,
}

/// Result of tracking plus estimation, before anything is committed.
struct Advance {
    correspondences: Vec<Correspondence>,
    relative: RelativePose,
    redetected: bool,
}

pub struct OdometryEngine<S: ImageSource, T: FeatureTracker = KltFeatureTracker> {
    source: S,
    tracker: T,
    camera: CameraIntrinsics,
    estimator: PoseEstimator,
    min_tracked_features: usize,
    state: TrackState,
    frames: FrameStore,
    motion: MotionIntegrator,
    /// World pose after each stored frame.
    poses: Vec<WorldPose>,
    halted_at: Option<usize>,
}

impl<S: ImageSource> OdometryEngine<S, KltFeatureTracker> {
    /// Engine with the stock corner + KLT front end.
    pub fn new(source: S, camera: CameraIntrinsics, config: OdometryConfig) -> Result<Self, ConfigError> {
        let tracker = KltFeatureTracker::new(config.detector.clone(), config.tracker.clone());
        Self::with_tracker(source, tracker, camera, config)
    }
}

impl<S: ImageSource, T: FeatureTracker> OdometryEngine<S, T> {
    pub fn with_tracker(source: S, tracker: T, camera: CameraIntrinsics, config: OdometryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(OdometryEngine {
            source,
            tracker,
            camera,
            estimator: PoseEstimator::new(config.pose),
            min_tracked_features: config.min_tracked_features,
            state: TrackState::Uninitialized,
            frames: FrameStore::new(),
            motion: MotionIntegrator::new(),
            poses: Vec::new(),
            halted_at: None,
        })
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn frames(&self) -> &FrameStore {
        &self.frames
    }

    pub fn latest_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn world_pose(&self) -> &WorldPose {
        self.motion.pose()
    }

    pub fn camera(&self) -> &CameraIntrinsics {
        &self.camera
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn is_halted(&self) -> bool {
        self.halted_at.is_some()
    }

    /// World pose of every stored frame, oldest first.
    pub fn trajectory(&self) -> Vec<TrajectoryPoint> {
        self.poses
            .iter()
            .enumerate()
            .map(|(i, pose)| TrajectoryPoint::new(i, pose))
            .collect()
    }

    /// Bootstrap from the first two images of the source.
    ///
    /// On failure nothing is stored and the engine stays `Uninitialized`.
    pub fn initialize(&mut self) -> Result<StepReport, OdometryError> {
        if self.state != TrackState::Uninitialized {
            return Err(OdometryError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }
        let failed = OdometryError::InitializationFailed;

        let count = self.source.count();
        if count < 2 {
            return Err(failed(InitFailure::NotEnoughImages(count)));
        }
        let first = self.source.get(0).ok_or(failed(InitFailure::MissingImage(0)))?.into_grayscale();
        let second = self.source.get(1).ok_or(failed(InitFailure::MissingImage(1)))?.into_grayscale();
        if let Some(index) = [&first, &second].iter().position(|img| img.is_empty()) {
            return Err(failed(InitFailure::EmptyImage(index)));
        }

        let features = self.tracker.detect(&first);
        if features.is_empty() {
            return Err(failed(InitFailure::NoFeatures));
        }
        let correspondences = self.tracker.track(&first, &second, &features);
        let relative = self
            .estimate(&correspondences)
            .map_err(|e| failed(InitFailure::Pose(Box::new(e))))?;

        self.frames.push(Frame::first(first, features));
        self.poses.push(*self.motion.pose());

        let report = self.commit(1, second, correspondences, relative, false);
        self.state = TrackState::Tracking;
        info!(
            "initialized: {} correspondences, {} inliers between frames 0 and 1",
            report.tracked, report.inliers
        );
        Ok(report)
    }

    /// Process the next image, or `None` when the source is exhausted.
    pub fn step(&mut self, image: Option<InputImage>) -> Result<StepOutcome, OdometryError> {
        match self.state {
            TrackState::Uninitialized => {
                return Err(OdometryError::InvalidState {
                    operation: "step",
                    state: self.state,
                })
            }
            TrackState::EndOfSequence => {
                warn!("step called after the end of the sequence; ignoring");
                return Ok(StepOutcome::EndOfSequence);
            }
            TrackState::Tracking => {}
        }
        if let Some(frame_index) = self.halted_at {
            return Err(OdometryError::Halted { frame_index });
        }

        let Some(image) = image else {
            self.state = TrackState::EndOfSequence;
            info!("end of sequence after {} frames", self.frames.len());
            return Ok(StepOutcome::EndOfSequence);
        };

        let index = self.frames.len();
        let gray = image.into_grayscale();
        if gray.is_empty() {
            warn!("frame {index}: empty image rejected");
            return Err(OdometryError::EmptyImage { frame_index: index });
        }
        match self.track_and_estimate(&gray) {
            Ok(advance) => {
                let report = self.commit(index, gray, advance.correspondences, advance.relative, advance.redetected);
                Ok(StepOutcome::Advanced(report))
            }
            Err(e) => {
                warn!("frame {index}: {e}; halting");
                self.halted_at = Some(index);
                Err(e)
            }
        }
    }

    /// Fetch the image after the last stored frame and `step` with it.
    pub fn advance(&mut self) -> Result<StepOutcome, OdometryError> {
        if self.state == TrackState::Uninitialized {
            return Err(OdometryError::InvalidState {
                operation: "advance",
                state: self.state,
            });
        }
        let next = self.frames.len();
        let image = if next < self.source.count() { self.source.get(next) } else { None };
        self.step(image)
    }

    /// Initialize if needed, then advance until the source is exhausted.
    /// Returns the number of stored frames.
    pub fn run(&mut self) -> Result<usize, OdometryError> {
        if self.state == TrackState::Uninitialized {
            self.initialize()?;
        }
        while let StepOutcome::Advanced(_) = self.advance()? {}
        Ok(self.frames.len())
    }

    fn track_and_estimate(&self, gray: &Image<u8>) -> Result<Advance, OdometryError> {
        let last = self.frames.last().ok_or(OdometryError::InvalidState {
            operation: "step",
            state: self.state,
        })?;

        let mut redetected = false;
        let mut correspondences = if last.features().len() <= self.min_tracked_features {
            debug!(
                "frame {}: {} features at or below {}, re-detecting",
                last.index(),
                last.features().len(),
                self.min_tracked_features
            );
            redetected = true;
            let fresh = self.tracker.detect(last.image());
            self.tracker.track(last.image(), gray, &fresh)
        } else {
            self.tracker.track(last.image(), gray, last.features())
        };

        let relative = match self.estimate(&correspondences) {
            Ok(relative) => relative,
            Err(e) if e.is_recoverable() && !redetected => {
                warn!("frame {}: {e}; re-detecting and retrying", last.index() + 1);
                redetected = true;
                let fresh = self.tracker.detect(last.image());
                correspondences = self.tracker.track(last.image(), gray, &fresh);
                self.estimate(&correspondences)?
            }
            Err(e) => return Err(e),
        };

        Ok(Advance { correspondences, relative, redetected })
    }

    fn estimate(&self, correspondences: &[Correspondence]) -> Result<RelativePose, OdometryError> {
        if !self.camera.has_distortion() {
            return self.estimator.estimate(correspondences, &self.camera.matrix());
        }
        let undistort = |p: nalgebra::Point2<f64>| {
            let (u, v) = self.camera.undistort_point(p.x, p.y);
            nalgebra::Point2::new(u, v)
        };
        let undistorted: Vec<Correspondence> = correspondences
            .iter()
            .map(|c| Correspondence::new(undistort(c.prev), undistort(c.curr)))
            .collect();
        self.estimator.estimate(&undistorted, &self.camera.matrix())
    }

    fn commit(
        &mut self,
        index: usize,
        gray: Image<u8>,
        correspondences: Vec<Correspondence>,
        relative: RelativePose,
        redetected: bool,
    ) -> StepReport {
        self.motion.integrate_pose(&relative);
        self.poses.push(*self.motion.pose());

        let report = StepReport {
            frame_index: index,
            tracked: correspondences.len(),
            inliers: relative.num_inliers(),
            redetected,
        };
        let features = correspondences.iter().map(|c| c.curr).collect();
        self.frames.push(Frame::new(index, gray, features, relative, correspondences.len()));

        let t = self.motion.pose().translation;
        debug!(
            "frame {index}: {} tracked, {} inliers{}, position [{:.3}, {:.3}, {:.3}]",
            report.tracked,
            report.inliers,
            if redetected { ", re-detected" } else { "" },
            t.x,
            t.y,
            t.z
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::PixelLayout;

    fn flat(n: usize) -> Vec<InputImage> {
        (0..n).map(|_| InputImage::new(64, 48, PixelLayout::Luma, vec![90; 64 * 48])).collect()
    }

    fn engine(images: Vec<InputImage>) -> OdometryEngine<Vec<InputImage>> {
        let camera = CameraIntrinsics::pinhole(500.0, 500.0, 32.0, 24.0).unwrap();
        OdometryEngine::new(images, camera, OdometryConfig::default()).unwrap()
    }

    #[test]
    fn test_vec_is_image_source() {
        let images = flat(3);
        assert_eq!(ImageSource::count(&images), 3);
        assert!(ImageSource::get(&images, 2).is_some());
        assert!(ImageSource::get(&images, 3).is_none());
    }

    #[test]
    fn test_step_before_initialize_is_rejected() {
        let mut e = engine(flat(3));
        let err = e.step(flat(1).pop()).unwrap_err();
        assert!(matches!(
            err,
            OdometryError::InvalidState { operation: "step", state: TrackState::Uninitialized }
        ));
        assert!(matches!(e.advance(), Err(OdometryError::InvalidState { .. })));
        assert!(e.frames().is_empty());
    }

    #[test]
    fn test_initialize_needs_two_images() {
        let mut e = engine(flat(1));
        let err = e.initialize().unwrap_err();
        assert!(matches!(err, OdometryError::InitializationFailed(InitFailure::NotEnoughImages(1))));
        assert_eq!(e.state(), TrackState::Uninitialized);
        assert!(e.frames().is_empty());
        assert_eq!(*e.world_pose(), WorldPose::identity());
    }

    #[test]
    fn test_initialize_without_features_fails_cleanly() {
        let mut e = engine(flat(2));
        let err = e.initialize().unwrap_err();
        assert!(matches!(err, OdometryError::InitializationFailed(InitFailure::NoFeatures)));
        assert_eq!(e.state(), TrackState::Uninitialized);
        assert!(e.trajectory().is_empty());
    }

    #[test]
    fn test_initialize_rejects_empty_image() {
        let mut images = flat(2);
        images[1] = InputImage::new(0, 0, PixelLayout::Luma, Vec::new());
        let mut e = engine(images);
        let err = e.initialize().unwrap_err();
        assert!(matches!(err, OdometryError::InitializationFailed(InitFailure::EmptyImage(1))));
        assert_eq!(e.state(), TrackState::Uninitialized);
        assert!(e.frames().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let camera = CameraIntrinsics::pinhole(500.0, 500.0, 32.0, 24.0).unwrap();
        let mut config = OdometryConfig::default();
        config.pose.confidence = 1.0;
        assert!(OdometryEngine::new(flat(2), camera, config).is_err());
    }
}
