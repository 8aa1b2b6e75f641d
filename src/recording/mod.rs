mod ffmpeg;

pub use ffmpeg::FfmpegRecorder;

use crate::capture::MediaStream;
use crate::config::RecordingConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Suffix of every download artifact name
pub const ARTIFACT_SUFFIX: &str = "-locastream.webm";

/// Encoder tapping the raw stream
///
/// Chunks go out through the channel handed to `start`. Empty chunks are
/// allowed; the controller skips them.
#[async_trait]
pub trait MediaRecorder: Send {
    /// Begin encoding `stream`
    async fn start(&mut self, stream: MediaStream, chunks: mpsc::UnboundedSender<Vec<u8>>) -> Result<()>;

    /// Flush the encoder
    ///
    /// Every chunk sent before this returns ends up in the blob, whether or
    /// not the flush succeeds.
    async fn stop(&mut self) -> Result<()>;
}

/// Encoded chunks collected between start and stop
#[derive(Debug)]
pub struct RecordingSession {
    chunks: Vec<Vec<u8>>,
    media_type: String,
}

impl RecordingSession {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            chunks: Vec::new(),
            media_type: media_type.into(),
        }
    }

    /// Append a chunk, ignoring empty ones. Returns whether it was kept.
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return false;
        }
        self.chunks.push(chunk);
        true
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Join the chunks, in arrival order, into one blob
    pub fn finalize(self) -> Blob {
        Blob {
            data: self.chunks.concat().into(),
            media_type: self.media_type,
        }
    }
}

/// Immutable finalized recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Arc<[u8]>,
    media_type: String,
}

impl Blob {
    pub fn new(data: impl Into<Arc<[u8]>>, media_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            media_type: media_type.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }
}

/// A recorder that has been started and not yet stopped
///
/// `stop` consumes the recording, so a session stops at most once.
pub struct ActiveRecording {
    recorder: Box<dyn MediaRecorder>,
    stream: MediaStream,
    flushed: oneshot::Sender<()>,
    collector: JoinHandle<RecordingSession>,
}

/// Start accumulating encoded chunks from `stream`
pub async fn start_recording(
    mut recorder: Box<dyn MediaRecorder>,
    stream: &MediaStream,
    config: &RecordingConfig,
) -> Result<ActiveRecording> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    recorder
        .start(stream.clone(), tx)
        .await
        .context("Failed to start recorder")?;

    tracing::info!("Recording started ({})", config.mime_type);

    let (flushed, mut flush_done) = oneshot::channel::<()>();
    let mut session = RecordingSession::new(config.container_type());
    let collector = tokio::spawn(async move {
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => collect(&mut session, chunk),
                    None => break,
                },
                _ = &mut flush_done => {
                    // Keep what is buffered even if a sender is still alive
                    rx.close();
                    while let Some(chunk) = rx.recv().await {
                        collect(&mut session, chunk);
                    }
                    break;
                }
            }
        }
        session
    });

    Ok(ActiveRecording {
        recorder,
        stream: stream.clone(),
        flushed,
        collector,
    })
}

fn collect(session: &mut RecordingSession, chunk: Vec<u8>) {
    let size = chunk.len();
    if session.push(chunk) {
        tracing::debug!("Data available: {} bytes, chunk {}", size, session.len());
    }
}

impl ActiveRecording {
    /// Stop every track, flush the encoder and finalize the blob
    ///
    /// A failed flush is logged and the chunks collected so far are kept.
    pub async fn stop(mut self) -> Result<Blob> {
        self.stream.stop_tracks();
        if let Err(e) = self.recorder.stop().await {
            tracing::error!("Recorder failed to flush, keeping collected chunks: {:#}", e);
        }
        drop(self.recorder);
        let _ = self.flushed.send(());

        let session = self
            .collector
            .await
            .context("Chunk collector panicked")?;
        let chunk_count = session.len();
        let blob = session.finalize();

        tracing::info!(
            "Recording finalized: {} chunks, {} bytes, {}",
            chunk_count,
            blob.size(),
            blob.media_type()
        );
        Ok(blob)
    }
}

/// Locally saved copy of the recording
#[derive(Debug, Clone)]
pub struct DownloadArtifact {
    path: PathBuf,
}

impl DownloadArtifact {
    /// `<epoch-millis>-locastream.webm`
    pub fn file_name_at(epoch_millis: i64) -> String {
        format!("{epoch_millis}{ARTIFACT_SUFFIX}")
    }

    /// Write `blob` into `dir` under a name stamped with the current time
    pub async fn save(blob: &Blob, dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create download directory {}", dir.display()))?;

        let name = Self::file_name_at(chrono::Utc::now().timestamp_millis());
        let path = dir.join(name);
        tokio::fs::write(&path, blob.data())
            .await
            .with_context(|| format!("Failed to write recording to {}", path.display()))?;

        tracing::info!("Recording saved to {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// `file://` URL for the saved recording
    pub fn url(&self) -> Result<url::Url> {
        let absolute = std::path::absolute(&self.path)
            .with_context(|| format!("Failed to resolve {}", self.path.display()))?;
        url::Url::from_file_path(&absolute)
            .map_err(|()| anyhow!("{} cannot be expressed as a file URL", absolute.display()))
    }
}
