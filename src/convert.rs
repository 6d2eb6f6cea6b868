// convert.rs — Raw input frames and their conversion to grayscale.
//
// Image sources hand the engine interleaved 8-bit buffers in whatever
// channel order they decoded. Everything downstream works on a single
// luma channel, so each frame is converted exactly once when it enters
// the pipeline.
//
// Color → luma uses the ITU-R BT.601 coefficients:
//   Y = 0.299 R + 0.587 G + 0.114 B

use crate::image::Image;

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Channel layout of an interleaved 8-bit buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Luma,
    Rgb,
    Bgr,
    Rgba,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Luma => 1,
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            PixelLayout::Rgba => 4,
        }
    }
}

/// An undecoded-into-grayscale frame as delivered by an image source.
#[derive(Debug, Clone, PartialEq)]
pub struct InputImage {
    width: usize,
    height: usize,
    layout: PixelLayout,
    data: Vec<u8>,
}

impl InputImage {
    /// # Panics
    /// Panics if `data.len() != width * height * layout.channels()`.
    pub fn new(width: usize, height: usize, layout: PixelLayout, data: Vec<u8>) -> Self {
        assert_eq!(
            data.len(),
            width * height * layout.channels(),
            "buffer length does not match {width}x{height} {layout:?}"
        );
        InputImage { width, height, layout, data }
    }

    /// Wrap an existing grayscale image.
    pub fn from_gray(gray: Image<u8>) -> Self {
        let (width, height) = (gray.width(), gray.height());
        InputImage { width, height, layout: PixelLayout::Luma, data: gray.into_vec() }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Single-channel luma image.
    pub fn to_grayscale(&self) -> Image<u8> {
        let gray = match self.layout {
            PixelLayout::Luma => self.data.clone(),
            PixelLayout::Rgb => self.data.chunks_exact(3).map(|p| luma(p[0], p[1], p[2])).collect(),
            PixelLayout::Bgr => self.data.chunks_exact(3).map(|p| luma(p[2], p[1], p[0])).collect(),
            PixelLayout::Rgba => self.data.chunks_exact(4).map(|p| luma(p[0], p[1], p[2])).collect(),
        };
        Image::from_vec(self.width, self.height, gray)
    }

    /// Consume the frame, avoiding a copy when it is already grayscale.
    pub fn into_grayscale(self) -> Image<u8> {
        match self.layout {
            PixelLayout::Luma => Image::from_vec(self.width, self.height, self.data),
            _ => self.to_grayscale(),
        }
    }
}

impl From<Image<u8>> for InputImage {
    fn from(gray: Image<u8>) -> Self {
        InputImage::from_gray(gray)
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}
