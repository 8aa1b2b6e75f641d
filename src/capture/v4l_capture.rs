use super::CaptureSource;
use anyhow::{Context, Result};
use image::{imageops, DynamicImage, RgbImage, RgbaImage};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

/// Video-only webcam source producing fixed-size RGBA frames
pub struct WebcamCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    pub fn new(device_index: u32, width: u32, height: u32) -> Result<Self> {
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            device_index,
            width,
            height
        );

        let index = CameraIndex::Index(device_index);
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);

        let mut camera = Camera::new(index, requested)
            .context("Failed to open camera")?;

        camera.open_stream()
            .context("Failed to open camera stream")?;

        let native = camera.resolution();
        tracing::info!(
            "Webcam streaming at {}x{}, frames scaled to {}x{}",
            native.width(),
            native.height(),
            width,
            height
        );

        Ok(Self {
            camera,
            width,
            height,
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbaImage> {
        let frame = self
            .camera
            .frame()
            .context("Failed to capture frame")?;

        let decoded = frame.decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        // nokhwa links its own `image` version; rebuild from raw bytes
        let (w, h) = (decoded.width(), decoded.height());
        let rgb = RgbImage::from_raw(w, h, decoded.into_raw())
            .context("Decoded frame has inconsistent size")?;
        let rgba = DynamicImage::ImageRgb8(rgb).into_rgba8();
        if rgba.dimensions() == (self.width, self.height) {
            return Ok(rgba);
        }

        Ok(imageops::resize(
            &rgba,
            self.width,
            self.height,
            imageops::FilterType::Triangle,
        ))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {}", e);
        }
    }
}
