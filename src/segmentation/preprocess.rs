use crate::config::{Architecture, InternalResolution, ModelConfig};
use anyhow::{ensure, Result};
use image::{imageops, ImageBuffer, Luma, RgbaImage};
use ndarray::Array4;

/// Per-channel means subtracted by the ResNet50 variant
const RESNET_MEAN: [f32; 3] = [-123.15, -115.90, -103.06];

type ScoreImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Preprocessor for converting RGBA frames to model input tensors
pub struct Preprocessor {
    architecture: Architecture,
    output_stride: u32,
}

impl Preprocessor {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            architecture: config.architecture,
            output_stride: config.output_stride,
        }
    }

    /// Model input size for a frame at the requested internal resolution
    ///
    /// Each side is scaled, then snapped to `floor(side / stride) * stride + 1`.
    pub fn input_size(&self, width: u32, height: u32, resolution: InternalResolution) -> (u32, u32) {
        let scale = resolution.scale();
        let snap = |side: u32| {
            let scaled = ((side as f32 * scale).floor() as u32).max(1);
            let stride = self.output_stride;
            if (scaled - 1) % stride == 0 {
                scaled
            } else {
                (scaled / stride) * stride + 1
            }
        };
        (snap(width), snap(height))
    }

    /// Preprocess an RGBA image into a normalized NHWC tensor
    ///
    /// Alpha is dropped. Returns: Array4<f32> with shape [1, height, width, 3]
    pub fn preprocess(&self, image: &RgbaImage, input_size: (u32, u32)) -> Result<Array4<f32>> {
        let _span = tracing::debug_span!("preprocess").entered();
        let (width, height) = input_size;

        let resized = if image.dimensions() != input_size {
            imageops::resize(image, width, height, imageops::FilterType::Triangle)
        } else {
            image.clone()
        };

        let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = self.normalize(pixel[c], c);
            }
        }

        Ok(tensor)
    }

    fn normalize(&self, value: u8, channel: usize) -> f32 {
        match self.architecture {
            Architecture::MobileNetV1 => value as f32 / 127.5 - 1.0,
            Architecture::ResNet50 => value as f32 + RESNET_MEAN[channel],
        }
    }

    /// Turn segment logits into person scores at the target resolution
    ///
    /// Returns: sigmoid scores flattened in row-major order
    pub fn postprocess_scores(
        logits: &[f32],
        logits_width: u32,
        logits_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<Vec<f32>> {
        let _span = tracing::debug_span!("postprocess").entered();
        ensure!(
            logits.len() == (logits_width * logits_height) as usize,
            "segment output has {} values, expected {}x{}",
            logits.len(),
            logits_width,
            logits_height
        );

        let scores: Vec<f32> = logits.iter().map(|&l| sigmoid(l)).collect();
        if logits_width == target_width && logits_height == target_height {
            return Ok(scores);
        }

        let Some(small) = ScoreImage::from_raw(logits_width, logits_height, scores) else {
            anyhow::bail!("failed to wrap segment scores as an image");
        };
        let resized = imageops::resize(
            &small,
            target_width,
            target_height,
            imageops::FilterType::Triangle,
        );

        Ok(resized.into_raw())
    }

    /// Mirror scores left to right, row by row
    pub fn flip_horizontal(scores: &mut [f32], width: u32) {
        for row in scores.chunks_exact_mut(width as usize) {
            row.reverse();
        }
    }

    /// Mean score over pixels classified as person, or 0.0 if there are none
    pub fn person_score(scores: &[f32], threshold: f32) -> f32 {
        let (sum, count) = scores
            .iter()
            .filter(|&&s| s > threshold)
            .fold((0.0f32, 0usize), |(sum, count), &s| (sum + s, count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f32
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
