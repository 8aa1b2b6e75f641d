use crate::error::CompositeError;
use image::RgbaImage;
use std::sync::Arc;

/// One sampled image from the live video source
///
/// Pixels are RGBA, row-major, 4 bytes per pixel. Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Arc<RgbaImage>,
    sequence: u64,
}

impl Frame {
    pub fn new(pixels: RgbaImage, sequence: u64) -> Self {
        Self {
            pixels: Arc::new(pixels),
            sequence,
        }
    }

    /// Frame filled with a single RGBA colour
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self::new(RgbaImage::from_pixel(width, height, image::Rgba(rgba)), 0)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn image(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }
}

/// Per-pixel labels for one frame, row-major
///
/// `0` means "show the live frame here", anything else means "keep what the
/// output surface already holds".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    labels: Vec<u8>,
}

impl Mask {
    pub fn new(width: u32, height: u32, labels: Vec<u8>) -> Result<Self, CompositeError> {
        let expected = (width * height) as usize;
        if labels.len() != expected {
            return Err(CompositeError::MaskLength {
                expected,
                actual: labels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            labels,
        })
    }

    pub fn filled(width: u32, height: u32, label: u8) -> Self {
        Self {
            width,
            height,
            labels: vec![label; (width * height) as usize],
        }
    }

    /// Binarise person scores: strictly above `threshold` becomes 1
    pub fn from_scores(
        width: u32,
        height: u32,
        scores: &[f32],
        threshold: f32,
    ) -> Result<Self, CompositeError> {
        let labels = scores
            .iter()
            .map(|&score| u8::from(score > threshold))
            .collect();
        Self::new(width, height, labels)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Label at `n = x + y * width`
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.labels[(x + y * self.width) as usize]
    }
}

/// Hidden capture surface plus the visible output surface
///
/// The output surface persists across cycles: pixels the compositor does not
/// write keep whatever the previous cycle left there.
pub struct FrameBufferPair {
    capture: RgbaImage,
    output: RgbaImage,
}

impl FrameBufferPair {
    /// Both surfaces start transparent black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            capture: RgbaImage::new(width, height),
            output: RgbaImage::new(width, height),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.output.dimensions()
    }

    /// Copy the live frame into the capture surface and snapshot it
    pub fn sample(&mut self, live: &Frame) -> Result<Frame, CompositeError> {
        check_dimensions("frame", self.capture.dimensions(), live.dimensions())?;
        self.capture.copy_from_slice(live.as_raw());
        Ok(Frame::new(self.capture.clone(), live.sequence()))
    }

    pub fn output(&self) -> &RgbaImage {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut RgbaImage {
        &mut self.output
    }

    /// Replace the output surface, e.g. to seed it with a background
    pub fn seed_output(&mut self, image: RgbaImage) -> Result<(), CompositeError> {
        check_dimensions("seed image", self.output.dimensions(), image.dimensions())?;
        self.output = image;
        Ok(())
    }
}

pub(crate) fn check_dimensions(
    what: &'static str,
    expected: (u32, u32),
    actual: (u32, u32),
) -> Result<(), CompositeError> {
    if expected != actual {
        return Err(CompositeError::DimensionMismatch {
            what,
            expected_width: expected.0,
            expected_height: expected.1,
            actual_width: actual.0,
            actual_height: actual.1,
        });
    }
    Ok(())
}
