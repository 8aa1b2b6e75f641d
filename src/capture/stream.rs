use super::CaptureSource;
use crate::error::CaptureError;
use crate::frame::Frame;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// Live video stream shared by the render loop and the recorder
///
/// Holds the most recent frame and whether the tracks are still running.
/// Clones refer to the same stream.
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    frames: watch::Sender<Option<Frame>>,
    active: watch::Sender<bool>,
}

impl MediaStream {
    pub fn new() -> Self {
        let (frames, _) = watch::channel(None);
        let (active, _) = watch::channel(true);
        Self {
            inner: Arc::new(StreamInner { frames, active }),
        }
    }

    /// Make `frame` the current frame. Ignored once the tracks are stopped.
    pub fn publish(&self, frame: Frame) {
        if self.is_active() {
            self.inner.frames.send_replace(Some(frame));
        }
    }

    pub fn current_frame(&self) -> Option<Frame> {
        self.inner.frames.borrow().clone()
    }

    /// Resolves with the first frame that carries pixel data
    pub async fn first_frame(&self) -> Frame {
        let mut rx = self.inner.frames.subscribe();
        loop {
            if let Some(frame) = rx.borrow_and_update().clone() {
                return frame;
            }
            if rx.changed().await.is_err() {
                // Sender lives as long as `self`
                std::future::pending::<()>().await;
            }
        }
    }

    /// Receiver notified on every new frame
    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.inner.frames.subscribe()
    }

    pub fn is_active(&self) -> bool {
        *self.inner.active.borrow()
    }

    /// Resolves once the tracks have been stopped
    pub async fn ended(&self) {
        let mut rx = self.inner.active.subscribe();
        // Sender is owned by `self`, so this cannot fail
        let _ = rx.wait_for(|active| !*active).await;
    }

    /// Stop every track. Later calls are no-ops.
    pub fn stop_tracks(&self) {
        if self.inner.active.send_replace(false) {
            tracing::info!("Stream tracks stopped");
        }
    }
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a capture source on its own thread and start streaming
///
/// `open` runs on the capture thread. If it fails, nothing is left running.
pub async fn acquire_stream<F, C>(open: F, fps: u32) -> Result<MediaStream, CaptureError>
where
    F: FnOnce() -> anyhow::Result<C> + Send + 'static,
    C: CaptureSource + 'static,
{
    let stream = MediaStream::new();
    let pump = stream.clone();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(u32, u32), String>>();

    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            let mut source = match open() {
                Ok(source) => source,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("{e:#}")));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(source.resolution()));
            pump_frames(&mut source, &pump, fps);
        })
        .map_err(|e| CaptureError::Unavailable(format!("failed to spawn capture thread: {e}")))?;

    match ready_rx.await {
        Ok(Ok((width, height))) => {
            tracing::info!("Stream acquired at {}x{}, {} fps", width, height, fps);
            Ok(stream)
        }
        Ok(Err(msg)) => Err(CaptureError::Unavailable(msg)),
        Err(_) => Err(CaptureError::Unavailable(
            "capture thread exited during start".to_string(),
        )),
    }
}

fn pump_frames<C: CaptureSource>(source: &mut C, stream: &MediaStream, fps: u32) {
    let frame_duration = Duration::from_secs_f32(1.0 / fps.max(1) as f32);
    let mut sequence = 0u64;

    while stream.is_active() {
        let start = Instant::now();

        match source.capture_frame() {
            Ok(pixels) => {
                sequence += 1;
                stream.publish(Frame::new(pixels, sequence));
            }
            Err(e) => {
                tracing::error!("Camera read failed, ending stream: {:#}", e);
                stream.stop_tracks();
                break;
            }
        }

        let elapsed = start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    tracing::info!("Capture thread stopped after {} frames", sequence);
}
