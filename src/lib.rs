// mono-vo: monocular visual odometry
// Corner detection and pyramidal KLT tracking, five-point RANSAC relative
// pose recovery, and world-frame trajectory integration.
//
// References: Nistér, "An efficient solution to the five-point relative
// pose problem" (PAMI 2004); Stewénius, Engels, Nistér, "Recent
// developments on direct relative orientation" (ISPRS 2006).

// Image plumbing
pub mod image;
pub mod convert;
pub mod convolution;
pub mod gradient;
pub mod pyramid;

// Front end
pub mod corners;
pub mod klt;
pub mod tracker;

// Geometry
pub mod camera;
pub mod essential;
pub mod pose;
pub mod motion;

// Engine
pub mod frame;
pub mod odometry;
pub mod config;
pub mod error;

pub use camera::CameraIntrinsics;
pub use config::OdometryConfig;
pub use convert::{InputImage, PixelLayout};
pub use error::{ConfigError, Degeneracy, InitFailure, OdometryError};
pub use frame::{Frame, FrameStore};
pub use motion::{MotionIntegrator, TrajectoryPoint, WorldPose};
pub use odometry::{ImageSource, OdometryEngine, StepOutcome, StepReport, TrackState};
pub use pose::{PoseConfig, PoseEstimator, RelativePose};
pub use tracker::{Correspondence, FeatureTracker, KltFeatureTracker};
