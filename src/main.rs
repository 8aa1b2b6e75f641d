mod capture;
mod compositor;
mod config;
mod error;
mod frame;
mod output;
mod recording;
mod render;
mod segmentation;
mod session;
mod upload;

use anyhow::{Context, Result};
use capture::WebcamCapture;
use clap::Parser;
use config::{
    Architecture, FileConfig, InternalResolution, ModelConfig, RecordingConfig, SegmentationConfig,
    DEFAULT_UPLOAD_PATH, FRAME_HEIGHT, FRAME_WIDTH,
};
use futures::FutureExt;
use output::V4L2Output;
use recording::FfmpegRecorder;
use render::{ModelLoad, RenderOptions};
use segmentation::{BodyPixSegmenter, MaskProvider};
use session::{Session, SessionConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use upload::{HttpUploadSink, UploadSink};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    #[arg(short, long, default_value = "/dev/video10")]
    output_device: String,

    /// Capture frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Minimum pause between render cycles, in milliseconds
    #[arg(long, default_value_t = 0)]
    tick_delay_ms: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// BodyPix ONNX file, or a directory holding the export for the chosen variant
    #[arg(long)]
    model: PathBuf,

    /// JSON file with segmentation, model and recording options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model resolution: low, medium, high, full or a scale in (0, 1]
    #[arg(long)]
    internal_resolution: Option<InternalResolution>,

    /// Person probability above which a pixel is classified as person
    #[arg(long)]
    segmentation_threshold: Option<f32>,

    /// Minimum mean person score for a detection to count
    #[arg(long)]
    score_threshold: Option<f32>,

    /// Mirror the mask horizontally
    #[arg(long)]
    flip_horizontal: bool,

    /// Maximum number of people to detect (0 disables segmentation)
    #[arg(long)]
    max_detections: Option<u32>,

    /// Network architecture
    #[arg(long, value_enum)]
    architecture: Option<Architecture>,

    /// Output stride: 8, 16 or 32
    #[arg(long)]
    output_stride: Option<u32>,

    /// MobileNetV1 depth multiplier: 0.5, 0.75 or 1.0
    #[arg(long)]
    multiplier: Option<f32>,

    /// Bytes per weight: 1, 2 or 4
    #[arg(long)]
    quant_bytes: Option<u32>,

    /// Recording mime type
    #[arg(long)]
    mime_type: Option<String>,

    /// Directory the recorded clip is saved to
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,

    /// Server base URL; the clip is posted to <server>/api/upload
    #[arg(long)]
    upload_server: Option<String>,

    /// Upload request timeout in seconds
    #[arg(long, default_value_t = 120)]
    upload_timeout: u64,
}

impl Args {
    /// Config file values with explicit flags on top
    fn resolve(&self) -> Result<(SegmentationConfig, ModelConfig, RecordingConfig)> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let FileConfig {
            mut segmentation,
            mut model,
            mut recording,
        } = file;

        if let Some(resolution) = self.internal_resolution {
            segmentation.internal_resolution = resolution;
        }
        if let Some(threshold) = self.segmentation_threshold {
            segmentation.segmentation_threshold = threshold;
        }
        if let Some(threshold) = self.score_threshold {
            segmentation.score_threshold = threshold;
        }
        if self.flip_horizontal {
            segmentation.flip_horizontal = true;
        }
        if let Some(max) = self.max_detections {
            segmentation.max_detections = max;
        }

        if let Some(architecture) = self.architecture {
            model.architecture = architecture;
        }
        if let Some(stride) = self.output_stride {
            model.output_stride = stride;
        }
        if let Some(multiplier) = self.multiplier {
            model.multiplier = multiplier;
        }
        if let Some(quant_bytes) = self.quant_bytes {
            model.quant_bytes = quant_bytes;
        }
        model.validate()?;

        if let Some(mime_type) = &self.mime_type {
            recording.mime_type = mime_type.clone();
        }

        Ok((segmentation, model, recording))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let (segmentation_config, model_config, recording_config) = args.resolve()?;

    tracing::info!("Locastream starting");
    tracing::info!("Frame size: {}x{}", FRAME_WIDTH, FRAME_HEIGHT);
    tracing::info!("Capture FPS: {}", args.fps);
    tracing::debug!("Segmentation: {:?}", segmentation_config);
    tracing::debug!("Model: {:?}", model_config);

    let output = V4L2Output::new(&args.output_device, FRAME_WIDTH, FRAME_HEIGHT)
        .context("Failed to initialize v4l2loopback output")?;

    // Loads in the background; the render loop starts once it resolves
    let model_path = args.model.clone();
    let model: ModelLoad = async move {
        let model = segmentation::load_model(&model_path, &model_config).await?;
        let provider: Arc<dyn MaskProvider> =
            Arc::new(BodyPixSegmenter::new(model, segmentation_config));
        Ok(provider)
    }
    .boxed();

    let recorder = FfmpegRecorder::new(recording_config.clone(), FRAME_WIDTH, FRAME_HEIGHT, args.fps);
    let session_config = SessionConfig {
        width: FRAME_WIDTH,
        height: FRAME_HEIGHT,
        fps: args.fps,
        render: RenderOptions {
            tick_delay: Duration::from_millis(args.tick_delay_ms),
        },
        recording: recording_config,
    };

    let device = args.input_device;
    let session = Session::start(
        move || WebcamCapture::new(device, FRAME_WIDTH, FRAME_HEIGHT),
        model,
        Box::new(output),
        Box::new(recorder),
        &session_config,
    )
    .await?;

    tracing::info!("Press Ctrl+C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl+C")?,
        _ = session.stream().ended() => tracing::warn!("Camera stream ended"),
    }

    let uploader = match &args.upload_server {
        Some(server) => {
            let endpoint = format!("{}{}", server.trim_end_matches('/'), DEFAULT_UPLOAD_PATH);
            Some(
                HttpUploadSink::new(&endpoint, Duration::from_secs(args.upload_timeout))
                    .context("Failed to build upload client")?,
            )
        }
        None => None,
    };

    let outcome = session
        .stop(
            &args.download_dir,
            uploader.as_ref().map(|sink| sink as &dyn UploadSink),
        )
        .await?;

    if let Some(report) = &outcome.render {
        tracing::info!(
            "Presented {} frames ({} dropped)",
            report.frames_presented,
            report.cycles_dropped
        );
    }
    tracing::info!("Download: {}", outcome.artifact.url()?);

    Ok(())
}
