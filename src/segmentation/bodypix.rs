use super::preprocess::Preprocessor;
use super::types::MaskProvider;
use crate::config::{ModelConfig, SegmentationConfig};
use crate::frame::{Frame, Mask};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Name of the person-segmentation logits output in the ONNX export
const SEGMENTS_OUTPUT: &str = "float_segments";

/// BodyPix person segmentation network
///
/// Stateless between calls: every frame is segmented on its own. The session
/// sits behind a mutex only because `Session::run` needs `&mut`.
pub struct BodyPix {
    session: Mutex<Session>,
    preprocessor: Preprocessor,
    config: ModelConfig,
}

impl BodyPix {
    /// Load a BodyPix ONNX export
    pub fn new<P: AsRef<Path>>(model_path: P, config: ModelConfig) -> Result<Self> {
        let path = model_path.as_ref();
        config.validate()?;

        tracing::info!(
            "Loading BodyPix {:?} (stride {}, multiplier {}, {} byte weights) from {}",
            config.architecture,
            config.output_stride,
            config.multiplier,
            config.quant_bytes,
            path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("BodyPix model loaded successfully");

        Ok(Self {
            session: Mutex::new(session),
            preprocessor: Preprocessor::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Person scores in [0, 1] for every pixel of `image`, row-major
    pub fn person_scores(&self, image: &RgbaImage, options: &SegmentationConfig) -> Result<Vec<f32>> {
        let _span = tracing::debug_span!("bodypix_segment").entered();
        let (width, height) = image.dimensions();

        let input_size = self
            .preprocessor
            .input_size(width, height, options.internal_resolution);
        let input_tensor = self.preprocessor.preprocess(image, input_size)?;

        let (logits, logits_width, logits_height) = {
            let _infer_span = tracing::debug_span!("inference").entered();
            let mut session = self
                .session
                .lock()
                .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
            let outputs = session
                .run(ort::inputs![TensorRef::from_array_view(input_tensor.view())?])
                .context("Failed to run inference")?;

            let segments = match outputs.get(SEGMENTS_OUTPUT) {
                Some(value) => value,
                None => &outputs[0],
            };

            // Shape: [1, H, W, 1]
            let segments = segments.try_extract_array::<f32>()?;
            let shape = segments.shape();
            anyhow::ensure!(
                shape.len() == 4,
                "unexpected segment output shape {:?}",
                shape
            );
            let (h, w) = (shape[1] as u32, shape[2] as u32);
            (segments.iter().copied().collect::<Vec<f32>>(), w, h)
        };

        let mut scores =
            Preprocessor::postprocess_scores(&logits, logits_width, logits_height, width, height)?;
        if options.flip_horizontal {
            Preprocessor::flip_horizontal(&mut scores, width);
        }

        Ok(scores)
    }

    /// Binary person mask honouring detection limits and thresholds
    pub fn segment_person(&self, frame: &Frame, options: &SegmentationConfig) -> Result<Mask> {
        let (width, height) = frame.dimensions();

        if options.max_detections == 0 {
            return Ok(Mask::filled(width, height, 0));
        }

        let scores = self.person_scores(frame.image(), options)?;
        let score = Preprocessor::person_score(&scores, options.segmentation_threshold);
        if score < options.score_threshold {
            tracing::debug!(
                "Person score {:.3} below threshold {:.3}, no person in frame {}",
                score,
                options.score_threshold,
                frame.sequence()
            );
            return Ok(Mask::filled(width, height, 0));
        }

        Ok(Mask::from_scores(
            width,
            height,
            &scores,
            options.segmentation_threshold,
        )?)
    }
}

/// [`MaskProvider`] running a shared [`BodyPix`] off the async runtime
pub struct BodyPixSegmenter {
    model: Arc<BodyPix>,
    options: SegmentationConfig,
}

impl BodyPixSegmenter {
    pub fn new(model: Arc<BodyPix>, options: SegmentationConfig) -> Self {
        Self { model, options }
    }
}

#[async_trait]
impl MaskProvider for BodyPixSegmenter {
    async fn segment(&self, frame: &Frame) -> Result<Mask> {
        let model = Arc::clone(&self.model);
        let options = self.options.clone();
        let frame = frame.clone();

        tokio::task::spawn_blocking(move || model.segment_person(&frame, &options))
            .await
            .context("Inference task panicked")?
    }
}
