use super::MediaRecorder;
use crate::capture::MediaStream;
use crate::config::RecordingConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bytes requested from the encoder per read
const CHUNK_SIZE: usize = 64 * 1024;

/// Records the raw stream by piping RGBA frames through `ffmpeg`
///
/// Every stdout read becomes one chunk.
pub struct FfmpegRecorder {
    config: RecordingConfig,
    width: u32,
    height: u32,
    fps: u32,
    child: Option<Child>,
    feeder: Option<JoinHandle<Result<u64>>>,
    reader: Option<JoinHandle<Result<usize>>>,
}

impl FfmpegRecorder {
    pub fn new(config: RecordingConfig, width: u32, height: u32, fps: u32) -> Self {
        Self {
            config,
            width,
            height,
            fps,
            child: None,
            feeder: None,
            reader: None,
        }
    }

    fn args(&self) -> Result<Vec<String>> {
        let (format, codec) = encoder_for(&self.config)?;
        Ok(vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgba".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            codec.into(),
            "-deadline".into(),
            "realtime".into(),
            "-f".into(),
            format.into(),
            "-".into(),
        ])
    }
}

/// Container and codec for a recording mime type
fn encoder_for(config: &RecordingConfig) -> Result<(&'static str, &'static str)> {
    let container = config.container_type();
    if container != "video/webm" {
        bail!("unsupported recording container {container}");
    }
    let codec = if config.mime_type.contains("vp8") {
        "libvpx"
    } else {
        "libvpx-vp9"
    };
    Ok(("webm", codec))
}

#[async_trait]
impl MediaRecorder for FfmpegRecorder {
    async fn start(&mut self, stream: MediaStream, chunks: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
        let args = self.args()?;
        tracing::debug!("Spawning ffmpeg {}", args.join(" "));

        let mut command = Command::new("ffmpeg");
        command.args(&args);
        self.spawn_encoder(command, stream, chunks)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            bail!("recorder was never started");
        };

        // The feeder exits once the tracks stop, closing ffmpeg's stdin
        let fed = join_task(self.feeder.take(), "Frame feeder").await;
        let read = join_task(self.reader.take(), "Chunk reader").await;
        let status = child.wait().await.context("Failed to wait for ffmpeg");

        if let Ok(Some(frames)) = &fed {
            tracing::debug!("Fed {} frames to ffmpeg", frames);
        }
        if let Ok(Some(count)) = &read {
            tracing::debug!("Read {} chunks from ffmpeg", count);
        }

        fed?;
        read?;
        let status = status?;
        if !status.success() {
            return Err(anyhow!("ffmpeg exited with {status}"));
        }
        Ok(())
    }
}

impl FfmpegRecorder {
    /// Run `command` as the encoder, wiring frames to its stdin and chunks from its stdout
    fn spawn_encoder(
        &mut self,
        mut command: Command,
        stream: MediaStream,
        chunks: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<()> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start ffmpeg")?;

        let stdin = child.stdin.take().context("ffmpeg stdin not piped")?;
        let stdout = child.stdout.take().context("ffmpeg stdout not piped")?;

        let frame_len = (self.width * self.height * 4) as usize;
        self.feeder = Some(tokio::spawn(feed_frames(stream, stdin, frame_len)));
        self.reader = Some(tokio::spawn(read_chunks(stdout, chunks)));
        self.child = Some(child);
        Ok(())
    }
}

async fn join_task<T>(task: Option<JoinHandle<Result<T>>>, name: &str) -> Result<Option<T>> {
    match task {
        Some(task) => task
            .await
            .with_context(|| format!("{name} panicked"))?
            .map(Some),
        None => Ok(None),
    }
}

async fn feed_frames(stream: MediaStream, mut stdin: ChildStdin, frame_len: usize) -> Result<u64> {
    let mut frames = stream.subscribe();
    // A frame already published counts as the first one to encode
    frames.mark_changed();
    let mut written = 0u64;

    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = stream.ended() => break,
        }

        let Some(frame) = frames.borrow_and_update().clone() else {
            continue;
        };
        if frame.as_raw().len() != frame_len {
            tracing::warn!("Skipping frame {} with unexpected size", frame.sequence());
            continue;
        }
        stdin
            .write_all(frame.as_raw())
            .await
            .context("Failed to write frame to ffmpeg")?;
        written += 1;
    }

    stdin.shutdown().await.context("Failed to close ffmpeg stdin")?;
    Ok(written)
}

async fn read_chunks(mut stdout: ChildStdout, chunks: mpsc::UnboundedSender<Vec<u8>>) -> Result<usize> {
    let mut count = 0;
    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = stdout
            .read(&mut buf)
            .await
            .context("Failed to read from ffmpeg")?;
        if n == 0 {
            break;
        }
        buf.truncate(n);
        if chunks.send(buf).is_err() {
            break;
        }
        count += 1;
    }
    Ok(count)
}
