use crate::capture::{acquire_stream, CaptureSource, MediaStream};
use crate::config::{RecordingConfig, FRAME_HEIGHT, FRAME_WIDTH};
use crate::output::OutputSink;
use crate::recording::{start_recording, ActiveRecording, DownloadArtifact, MediaRecorder};
use crate::render::{ModelLoad, RenderLoop, RenderOptions, RenderReport};
use crate::upload::UploadSink;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub render: RenderOptions,
    pub recording: RecordingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            fps: 30,
            render: RenderOptions::default(),
            recording: RecordingConfig::default(),
        }
    }
}

/// One start-to-stop lifecycle of camera capture and recording
///
/// Owns the stream, the render task and the active recording. `stop`
/// consumes the session.
pub struct Session {
    stream: MediaStream,
    render: JoinHandle<Result<RenderReport>>,
    recording: ActiveRecording,
}

/// Everything a stopped session leaves behind
#[derive(Debug)]
pub struct SessionOutcome {
    /// `None` if the render loop ended with an error
    pub render: Option<RenderReport>,
    pub artifact: DownloadArtifact,
    /// `None` if no sink was given or the upload failed
    pub upload_status: Option<u16>,
}

impl Session {
    /// Open the camera, start recording and launch the render loop
    ///
    /// Fails without leaving anything running if the camera cannot be opened
    /// or the recorder refuses to start.
    pub async fn start<F, C>(
        open: F,
        model: ModelLoad,
        mut sink: Box<dyn OutputSink>,
        recorder: Box<dyn MediaRecorder>,
        config: &SessionConfig,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<C> + Send + 'static,
        C: CaptureSource + 'static,
    {
        tracing::info!("Starting webcam");
        let stream = acquire_stream(open, config.fps)
            .await
            .context("Failed to start session")?;

        let recording = match start_recording(recorder, &stream, &config.recording).await {
            Ok(recording) => recording,
            Err(e) => {
                stream.stop_tracks();
                return Err(e);
            }
        };

        let render_stream = stream.clone();
        let mut render = RenderLoop::new(config.width, config.height, config.render.clone());
        let render = tokio::spawn(async move {
            let result = render.run(&render_stream, model, sink.as_mut()).await;
            if let Err(e) = &result {
                tracing::error!("Render loop halted: {:#}", e);
            }
            result
        });

        Ok(Self {
            stream,
            render,
            recording,
        })
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    /// Stop capture, finalize the recording, save it and hand it to `uploader`
    ///
    /// Upload failures are logged only; the saved artifact is returned either way.
    pub async fn stop(self, download_dir: &Path, uploader: Option<&dyn UploadSink>) -> Result<SessionOutcome> {
        tracing::info!("Stopping session");
        self.stream.stop_tracks();

        let render = match self.render.await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(_)) => None,
            Err(e) => {
                tracing::error!("Render task panicked: {}", e);
                None
            }
        };

        let blob = self.recording.stop().await?;
        let artifact = DownloadArtifact::save(&blob, download_dir).await?;

        let upload_status = match uploader {
            Some(uploader) => match uploader.upload(&blob).await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::error!("Upload failed, recording kept at {}: {}", artifact.path().display(), e);
                    None
                }
            },
            None => {
                tracing::info!("No upload endpoint configured");
                None
            }
        };

        Ok(SessionOutcome {
            render,
            artifact,
            upload_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UploadError;
    use crate::frame::{Frame, Mask};
    use crate::recording::{Blob, ARTIFACT_SUFFIX};
    use crate::segmentation::MaskProvider;
    use anyhow::bail;
    use async_trait::async_trait;
    use futures::FutureExt;
    use image::RgbaImage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const W: u32 = 8;
    const H: u32 = 4;

    struct GreenCamera;

    impl CaptureSource for GreenCamera {
        fn capture_frame(&mut self) -> Result<RgbaImage> {
            Ok(RgbaImage::from_pixel(W, H, image::Rgba([0, 255, 0, 255])))
        }

        fn resolution(&self) -> (u32, u32) {
            (W, H)
        }
    }

    #[derive(Clone, Default)]
    struct CountingSink {
        frames: Arc<AtomicUsize>,
    }

    impl OutputSink for CountingSink {
        fn write_frame(&mut self, _frame: &RgbaImage) -> Result<()> {
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resolution(&self) -> (u32, u32) {
            (W, H)
        }
    }

    struct BackgroundOnly;

    #[async_trait]
    impl MaskProvider for BackgroundOnly {
        async fn segment(&self, frame: &Frame) -> Result<Mask> {
            let (w, h) = frame.dimensions();
            Ok(Mask::filled(w, h, 0))
        }
    }

    /// Emits a chunk for each of the first three frames it sees
    struct ThreeChunkRecorder {
        started: Arc<AtomicBool>,
        task: Option<tokio::task::JoinHandle<()>>,
    }

    #[async_trait]
    impl MediaRecorder for ThreeChunkRecorder {
        async fn start(&mut self, stream: MediaStream, chunks: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            let mut frames = stream.subscribe();
            self.task = Some(tokio::spawn(async move {
                let mut sent = 0u8;
                while sent < 3 {
                    tokio::select! {
                        changed = frames.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = stream.ended() => break,
                    }
                    let _ = chunks.send(vec![sent + 1; 16]);
                    sent += 1;
                }
            }));
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if let Some(task) = self.task.take() {
                task.await?;
            }
            Ok(())
        }
    }

    /// Emits one chunk on start, then fails to flush
    struct BrokenEncoder {
        chunks: Option<mpsc::UnboundedSender<Vec<u8>>>,
    }

    #[async_trait]
    impl MediaRecorder for BrokenEncoder {
        async fn start(&mut self, _stream: MediaStream, chunks: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
            chunks.send(vec![9; 24])?;
            self.chunks = Some(chunks);
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            bail!("ffmpeg exited with status 1")
        }
    }

    struct FailingUpload {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl UploadSink for FailingUpload {
        async fn upload(&self, blob: &Blob) -> Result<u16, UploadError> {
            self.calls.lock().unwrap().push(blob.size());
            let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            Err(UploadError::Encode(err))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            width: W,
            height: H,
            fps: 100,
            ..Default::default()
        }
    }

    fn ready_model() -> ModelLoad {
        async { Ok(Arc::new(BackgroundOnly) as Arc<dyn MaskProvider>) }.boxed()
    }

    #[tokio::test]
    async fn recorded_clip_survives_failed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CountingSink::default();
        let presented = sink.frames.clone();
        let recorder = ThreeChunkRecorder {
            started: Arc::new(AtomicBool::new(false)),
            task: None,
        };

        let session = Session::start(|| Ok(GreenCamera), ready_model(), Box::new(sink), Box::new(recorder), &config())
            .await
            .unwrap();

        // Let the render loop and recorder see a few frames
        tokio::time::sleep(Duration::from_millis(100)).await;

        let uploader = FailingUpload {
            calls: Mutex::new(Vec::new()),
        };
        let outcome = session.stop(dir.path(), Some(&uploader)).await.unwrap();

        let report = outcome.render.unwrap();
        assert!(report.started);
        assert!(report.frames_presented > 0);
        assert_eq!(presented.load(Ordering::SeqCst) as u64, report.frames_presented);

        let saved = std::fs::read(outcome.artifact.path()).unwrap();
        assert_eq!(saved.len(), 48);
        let name = outcome.artifact.file_name().unwrap();
        let stamp = name.strip_suffix(ARTIFACT_SUFFIX).unwrap();
        assert!(!stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()));

        assert_eq!(*uploader.calls.lock().unwrap(), vec![48]);
        assert_eq!(outcome.upload_status, None);
    }

    #[tokio::test]
    async fn encoder_failure_still_saves_clip() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = BrokenEncoder { chunks: None };

        let session = Session::start(
            || Ok(GreenCamera),
            ready_model(),
            Box::new(CountingSink::default()),
            Box::new(recorder),
            &config(),
        )
        .await
        .unwrap();

        let outcome = session.stop(dir.path(), None).await.unwrap();
        assert_eq!(std::fs::read(outcome.artifact.path()).unwrap(), vec![9; 24]);
        assert_eq!(outcome.upload_status, None);
    }

    #[tokio::test]
    async fn unavailable_camera_aborts_start() {
        let started = Arc::new(AtomicBool::new(false));
        let recorder = ThreeChunkRecorder {
            started: started.clone(),
            task: None,
        };

        let result = Session::start(
            || -> Result<GreenCamera> { bail!("permission denied") },
            ready_model(),
            Box::new(CountingSink::default()),
            Box::new(recorder),
            &config(),
        )
        .await;

        assert!(result.is_err());
        assert!(!started.load(Ordering::SeqCst));
    }
}
