use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Width of every frame, mask and surface in a session
pub const FRAME_WIDTH: u32 = 800;
/// Height of every frame, mask and surface in a session
pub const FRAME_HEIGHT: u32 = 450;

/// Endpoint path the recorded clip is posted to
pub const DEFAULT_UPLOAD_PATH: &str = "/api/upload";

/// Resolution the model runs at, relative to the frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalResolution {
    Low,
    Medium,
    High,
    Full,
    #[serde(untagged)]
    Scale(f32),
}

impl InternalResolution {
    pub fn scale(self) -> f32 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Full => 1.0,
            Self::Scale(s) => s,
        }
    }
}

impl std::str::FromStr for InternalResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "full" => Ok(Self::Full),
            other => match other.parse::<f32>() {
                Ok(scale) if scale > 0.0 && scale <= 1.0 => Ok(Self::Scale(scale)),
                _ => Err(format!(
                    "expected low, medium, high, full or a scale in (0, 1], got {other}"
                )),
            },
        }
    }
}

/// Per-call segmentation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmentationConfig {
    pub internal_resolution: InternalResolution,
    pub segmentation_threshold: f32,
    pub score_threshold: f32,
    pub flip_horizontal: bool,
    pub max_detections: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            internal_resolution: InternalResolution::Full,
            segmentation_threshold: 0.01,
            score_threshold: 0.01,
            flip_horizontal: false,
            max_detections: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Architecture {
    #[value(name = "MobileNetV1")]
    MobileNetV1,
    #[value(name = "ResNet50")]
    ResNet50,
}

/// Options selecting which network variant to load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub output_stride: u32,
    pub multiplier: f32,
    pub quant_bytes: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::MobileNetV1,
            output_stride: 16,
            multiplier: 1.0,
            quant_bytes: 4,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if ![8, 16, 32].contains(&self.output_stride) {
            bail!("invalid output stride {}, expected 8, 16 or 32", self.output_stride);
        }
        if ![1, 2, 4].contains(&self.quant_bytes) {
            bail!("invalid quant bytes {}, expected 1, 2 or 4", self.quant_bytes);
        }
        match self.architecture {
            Architecture::MobileNetV1 => {
                if ![0.5, 0.75, 1.0].contains(&self.multiplier) {
                    bail!(
                        "invalid MobileNetV1 multiplier {}, expected 0.5, 0.75 or 1.0",
                        self.multiplier
                    );
                }
            }
            Architecture::ResNet50 => {
                if self.output_stride == 8 {
                    bail!("ResNet50 does not support output stride 8");
                }
                if self.multiplier != 1.0 {
                    bail!("ResNet50 only supports multiplier 1.0");
                }
            }
        }
        Ok(())
    }

    /// File name of the ONNX export for this variant
    pub fn model_file_name(&self) -> String {
        let arch = match self.architecture {
            Architecture::MobileNetV1 => "mobilenet_v1",
            Architecture::ResNet50 => "resnet50",
        };
        format!(
            "bodypix_{}_{:03}_stride{}_q{}.onnx",
            arch,
            (self.multiplier * 100.0).round() as u32,
            self.output_stride,
            self.quant_bytes
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    pub mime_type: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mime_type: "video/webm; codecs=vp9".to_string(),
        }
    }
}

impl RecordingConfig {
    /// Container type without codec parameters, e.g. `video/webm`
    pub fn container_type(&self) -> &str {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or(&self.mime_type)
            .trim()
    }
}

/// Everything a `--config` file may set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub segmentation: SegmentationConfig,
    pub model: ModelConfig,
    pub recording: RecordingConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.model.validate()?;
        Ok(config)
    }
}
