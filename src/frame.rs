// frame.rs — Per-step records kept by the odometry engine.
//
// A `Frame` is assembled completely before it is stored and never changes
// afterwards. `FrameStore` is append-only; frame indices equal positions.

use nalgebra::Point2;

use crate::image::Image;
use crate::pose::RelativePose;

#[derive(Debug, Clone)]
pub struct Frame {
    index: usize,
    gray: Image<u8>,
    features: Vec<Point2<f64>>,
    relative_pose: RelativePose,
    num_correspondences: usize,
}

impl Frame {
    /// First frame of a sequence: identity pose, no correspondences.
    pub fn first(gray: Image<u8>, features: Vec<Point2<f64>>) -> Self {
        Frame {
            index: 0,
            gray,
            features,
            relative_pose: RelativePose::identity(),
            num_correspondences: 0,
        }
    }

    pub fn new(
        index: usize,
        gray: Image<u8>,
        features: Vec<Point2<f64>>,
        relative_pose: RelativePose,
        num_correspondences: usize,
    ) -> Self {
        Frame { index, gray, features, relative_pose, num_correspondences }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Grayscale image the features live in.
    pub fn image(&self) -> &Image<u8> {
        &self.gray
    }

    /// Points carried forward to the next frame.
    pub fn features(&self) -> &[Point2<f64>] {
        &self.features
    }

    /// Motion from the previous frame (identity for frame 0).
    pub fn relative_pose(&self) -> &RelativePose {
        &self.relative_pose
    }

    /// Correspondences that reached pose estimation for this frame.
    pub fn num_correspondences(&self) -> usize {
        self.num_correspondences
    }

    pub fn num_inliers(&self) -> usize {
        self.relative_pose.num_inliers()
    }
}

/// Append-only frame history.
#[derive(Debug, Default)]
pub struct FrameStore {
    frames: Vec<Frame>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Panics
    /// Panics if `frame.index()` is not the next position.
    pub fn push(&mut self, frame: Frame) {
        assert_eq!(frame.index, self.frames.len(), "frames must be appended in order");
        self.frames.push(frame);
    }

    pub fn last(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> + '_ {
        self.frames.iter()
    }

    pub fn as_slice(&self) -> &[Frame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_appends_in_order() {
        let mut store = FrameStore::new();
        assert!(store.is_empty() && store.last().is_none());

        store.push(Frame::first(Image::new(4, 4), vec![Point2::new(1.0, 1.0)]));
        store.push(Frame::new(1, Image::new(4, 4), Vec::new(), RelativePose::identity(), 1));

        assert_eq!(store.len(), 2);
        assert_eq!(store.last().map(Frame::index), Some(1));
        assert_eq!(store.get(0).map(|f| f.features().len()), Some(1));
        assert_eq!(store.iter().map(Frame::index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    #[should_panic(expected = "in order")]
    fn test_out_of_order_push_panics() {
        let mut store = FrameStore::new();
        store.push(Frame::new(3, Image::new(2, 2), Vec::new(), RelativePose::identity(), 0));
    }
}
