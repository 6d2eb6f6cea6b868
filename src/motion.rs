// motion.rs — Chaining relative poses into a world trajectory.
//
// Composition convention, applied once per frame pair:
//
//   R_world ← R_rel · R_world
//   t_world ← t_world + R_world · t_rel     (using the updated R_world)
//
// Rotation is applied on the left and translation accumulated in the world
// frame with the new rotation. Changing either order changes every point
// of the trajectory after the first turn; `test_composition_order` pins it.
// Translation stays scale-free: each step contributes a unit vector.

use nalgebra::{Rotation3, Vector3};
use serde::{Deserialize, Serialize};

use crate::pose::RelativePose;

/// Accumulated camera pose in the world (first camera) frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl WorldPose {
    pub fn identity() -> Self {
        WorldPose {
            rotation: Rotation3::identity(),
            translation: Vector3::zeros(),
        }
    }
}

impl Default for WorldPose {
    fn default() -> Self {
        Self::identity()
    }
}

/// One exported trajectory sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub frame_index: usize,
    /// Camera position in the world frame.
    pub position: [f64; 3],
    /// Camera orientation as a row-major 3×3 matrix.
    pub rotation: [[f64; 3]; 3],
}

impl TrajectoryPoint {
    pub fn new(frame_index: usize, pose: &WorldPose) -> Self {
        let m = pose.rotation.matrix();
        TrajectoryPoint {
            frame_index,
            position: [pose.translation.x, pose.translation.y, pose.translation.z],
            rotation: std::array::from_fn(|i| std::array::from_fn(|j| m[(i, j)])),
        }
    }
}

/// Owns the world pose. It only moves forward and is never reset.
#[derive(Debug, Clone, Default)]
pub struct MotionIntegrator {
    pose: WorldPose,
}

impl MotionIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compose one relative motion onto the world pose.
    pub fn integrate(&mut self, rotation: &Rotation3<f64>, translation: &Vector3<f64>) {
        self.pose.rotation = rotation * self.pose.rotation;
        self.pose.translation += self.pose.rotation * translation;
    }

    pub fn integrate_pose(&mut self, relative: &RelativePose) {
        self.integrate(&relative.rotation, &relative.translation);
    }

    pub fn pose(&self) -> &WorldPose {
        &self.pose
    }

    /// Rebuild the world pose after each of `relatives`, starting from the
    /// identity. The first entry is the pose after the first relative.
    pub fn replay<'a, I>(relatives: I) -> Vec<WorldPose>
    where
        I: IntoIterator<Item = &'a RelativePose>,
    {
        let mut integrator = MotionIntegrator::new();
        relatives
            .into_iter()
            .map(|rel| {
                integrator.integrate_pose(rel);
                integrator.pose
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_composition_order() {
        let mut m = MotionIntegrator::new();
        let quarter = Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        m.integrate(&quarter, &Vector3::zeros());
        m.integrate(&Rotation3::identity(), &Vector3::zeros());

        assert_relative_eq!(m.pose().rotation, quarter, epsilon = 1e-12);
        assert_relative_eq!(m.pose().translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_translation_uses_updated_rotation() {
        let mut m = MotionIntegrator::new();
        let quarter = Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        m.integrate(&quarter, &Vector3::x());

        // R_world is the quarter turn already, so +X maps to +Y.
        assert_relative_eq!(m.pose().translation, Vector3::y(), epsilon = 1e-12);

        m.integrate(&Rotation3::identity(), &Vector3::x());
        assert_relative_eq!(m.pose().translation, Vector3::new(0.0, 2.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_applied_on_the_left() {
        let a = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.3);
        let b = Rotation3::from_axis_angle(&Vector3::y_axis(), 0.7);
        let mut m = MotionIntegrator::new();
        m.integrate(&a, &Vector3::zeros());
        m.integrate(&b, &Vector3::zeros());
        assert_relative_eq!(m.pose().rotation, b * a, epsilon = 1e-12);
    }

    #[test]
    fn test_replay_matches_incremental() {
        let rels: Vec<RelativePose> = (0..4)
            .map(|i| RelativePose {
                rotation: Rotation3::from_euler_angles(0.0, 0.1 * i as f64, 0.0),
                translation: Vector3::new(1.0, 0.0, 0.0),
                inlier_mask: Vec::new(),
            })
            .collect();

        let mut m = MotionIntegrator::new();
        for rel in &rels {
            m.integrate_pose(rel);
        }
        let replayed = MotionIntegrator::replay(&rels);
        assert_eq!(replayed.len(), 4);
        assert_eq!(replayed[3], *m.pose());
    }

    #[test]
    fn test_trajectory_point_serializes() {
        let pose = WorldPose {
            rotation: Rotation3::identity(),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let json = serde_json::to_string(&TrajectoryPoint::new(7, &pose)).unwrap();
        assert!(json.contains("\"frame_index\":7"));
        assert!(json.contains("\"position\":[1.0,2.0,3.0]"));
    }
}
