use crate::capture::MediaStream;
use crate::compositor::composite_into;
use crate::frame::FrameBufferPair;
use crate::output::OutputSink;
use crate::segmentation::MaskProvider;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pending model load handed to the render loop
pub type ModelLoad = BoxFuture<'static, Result<Arc<dyn MaskProvider>>>;

/// Frames between timing reports
const STATS_INTERVAL: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderState {
    #[default]
    Idle,
    WaitingForFirstFrame,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    /// The video source has usable pixel data for the first time
    FirstFrame,
    /// The segmentation model finished loading
    ModelLoaded,
    /// The stream's tracks were stopped
    StreamEnded,
}

/// Render loop state machine
///
/// Compositing starts only once both the first frame and the model are in,
/// whichever arrives last. The first frame always moves `Idle` to
/// `WaitingForFirstFrame`; with the model already loaded the scheduler leaves
/// that state within the same `handle` call. `Stopped` is terminal.
#[derive(Debug, Default)]
pub struct Scheduler {
    state: RenderState,
    model_ready: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    /// Apply `event` and settle; returns the resulting state
    pub fn handle(&mut self, event: RenderEvent) -> RenderState {
        self.state = self.settle(self.step(event));
        self.state
    }

    /// The single edge `event` takes from the current state
    fn step(&mut self, event: RenderEvent) -> RenderState {
        use RenderEvent::*;
        use RenderState::*;

        match (self.state, event) {
            (Stopped, _) | (_, StreamEnded) => Stopped,
            (Idle, FirstFrame) => WaitingForFirstFrame,
            (state, ModelLoaded) => {
                self.model_ready = true;
                state
            }
            (state, FirstFrame) => state,
        }
    }

    fn settle(&self, state: RenderState) -> RenderState {
        match state {
            RenderState::WaitingForFirstFrame if self.model_ready => RenderState::Running,
            state => state,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Pause between the end of one cycle and the start of the next
    pub tick_delay: Duration,
}

/// What a finished render loop did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderReport {
    pub final_state: RenderState,
    /// Whether compositing ever started
    pub started: bool,
    pub frames_presented: u64,
    /// Cycles abandoned because inference failed
    pub cycles_dropped: u64,
    /// Inference results thrown away because the stream had stopped
    pub results_discarded: u64,
}

#[derive(Default)]
struct StageTimings {
    capture: Duration,
    segment: Duration,
    composite: Duration,
    present: Duration,
}

/// Drives capture, segmentation, compositing and presentation
///
/// Exactly one inference is in flight at a time: the next tick is scheduled
/// only after the previous cycle has been composited and presented.
pub struct RenderLoop {
    scheduler: Scheduler,
    buffers: FrameBufferPair,
    options: RenderOptions,
    report: RenderReport,
    timings: StageTimings,
}

impl RenderLoop {
    pub fn new(width: u32, height: u32, options: RenderOptions) -> Self {
        Self {
            scheduler: Scheduler::new(),
            buffers: FrameBufferPair::new(width, height),
            options,
            report: RenderReport::default(),
            timings: StageTimings::default(),
        }
    }

    pub fn state(&self) -> RenderState {
        self.scheduler.state()
    }

    /// Current contents of the output surface
    pub fn output(&self) -> &RgbaImage {
        self.buffers.output()
    }

    /// Start from `image` instead of a transparent surface
    pub fn seed_output(&mut self, image: RgbaImage) -> Result<()> {
        self.buffers
            .seed_output(image)
            .context("Failed to seed output surface")
    }

    /// Run until the stream ends
    ///
    /// Inference failures drop the cycle and the loop carries on. Size
    /// mismatches and presentation failures end the loop with an error.
    pub async fn run(
        &mut self,
        stream: &MediaStream,
        model: ModelLoad,
        sink: &mut dyn OutputSink,
    ) -> Result<RenderReport> {
        let provider = self.wait_until_ready(stream, model).await;

        if let Some(provider) = provider {
            self.report.started = true;
            tracing::info!("Render loop running");

            while self.state() == RenderState::Running {
                self.tick(stream, provider.as_ref(), sink).await?;
                if self.state() != RenderState::Running {
                    break;
                }
                self.pause(stream).await;
            }
        }

        self.report.final_state = self.state();
        tracing::info!(
            "Render loop stopped: {} frames presented, {} dropped, {} discarded",
            self.report.frames_presented,
            self.report.cycles_dropped,
            self.report.results_discarded
        );
        Ok(self.report.clone())
    }

    fn transition(&mut self, event: RenderEvent) {
        let before = self.scheduler.state();
        let after = self.scheduler.handle(event);
        if before != after {
            tracing::debug!("Render state {:?} -> {:?} on {:?}", before, after, event);
        }
    }

    /// Race the model load against the first frame and the stream ending
    async fn wait_until_ready(
        &mut self,
        stream: &MediaStream,
        mut model: ModelLoad,
    ) -> Option<Arc<dyn MaskProvider>> {
        let mut provider = None;
        let mut model_pending = true;

        loop {
            match self.state() {
                RenderState::Running => return provider,
                RenderState::Stopped => return None,
                RenderState::Idle | RenderState::WaitingForFirstFrame => {}
            }
            let awaiting_frame = self.state() == RenderState::Idle;

            tokio::select! {
                result = &mut model, if model_pending => {
                    model_pending = false;
                    match result {
                        Ok(loaded) => {
                            tracing::info!("Segmentation model ready");
                            provider = Some(loaded);
                            self.transition(RenderEvent::ModelLoaded);
                        }
                        Err(e) => {
                            // No retry: the session stays in its loading state
                            tracing::error!("Segmentation model failed to load: {:#}", e);
                        }
                    }
                }
                frame = stream.first_frame(), if awaiting_frame => {
                    tracing::debug!("First frame {} available", frame.sequence());
                    self.transition(RenderEvent::FirstFrame);
                }
                _ = stream.ended() => {
                    self.transition(RenderEvent::StreamEnded);
                }
            }
        }
    }

    async fn tick(
        &mut self,
        stream: &MediaStream,
        provider: &dyn MaskProvider,
        sink: &mut dyn OutputSink,
    ) -> Result<()> {
        if !stream.is_active() {
            self.transition(RenderEvent::StreamEnded);
            return Ok(());
        }

        let capture_start = Instant::now();
        let Some(live) = stream.current_frame() else {
            return Ok(());
        };
        let frame = self.buffers.sample(&live)?;
        self.timings.capture += capture_start.elapsed();

        let segment_start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = stream.ended() => None,
            result = provider.segment(&frame) => Some(result),
        };
        let segment_time = segment_start.elapsed();

        // A result that lands after stop must never reach the surface
        let result = match result {
            Some(result) if stream.is_active() => result,
            _ => {
                tracing::debug!("Discarding result for frame {} after stop", frame.sequence());
                self.report.results_discarded += 1;
                self.transition(RenderEvent::StreamEnded);
                return Ok(());
            }
        };

        let mask = match result {
            Ok(mask) => mask,
            Err(e) => {
                tracing::error!(
                    "Segmentation failed for frame {}, dropping cycle: {:#}",
                    frame.sequence(),
                    e
                );
                self.report.cycles_dropped += 1;
                return Ok(());
            }
        };
        // Averaged over presented frames only
        self.timings.segment += segment_time;

        let composite_start = Instant::now();
        composite_into(&frame, &mask, self.buffers.output_mut())?;
        self.timings.composite += composite_start.elapsed();

        let present_start = Instant::now();
        sink.write_frame(self.buffers.output())
            .context("Failed to present frame")?;
        self.timings.present += present_start.elapsed();

        self.report.frames_presented += 1;
        if self.report.frames_presented % STATS_INTERVAL == 0 {
            self.log_stats();
        }

        Ok(())
    }

    /// Yield between ticks so stream and recorder events can run
    async fn pause(&mut self, stream: &MediaStream) {
        if self.options.tick_delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.options.tick_delay) => {}
            _ = stream.ended() => self.transition(RenderEvent::StreamEnded),
        }
    }

    fn log_stats(&self) {
        let frames = self.report.frames_presented as f64;
        let avg_ms = |total: Duration| total.as_secs_f64() * 1000.0 / frames;
        let capture_ms = avg_ms(self.timings.capture);
        let segment_ms = avg_ms(self.timings.segment);
        let composite_ms = avg_ms(self.timings.composite);
        let present_ms = avg_ms(self.timings.present);
        let total_ms = capture_ms + segment_ms + composite_ms + present_ms;

        tracing::info!(
            "Frame {}: capture={:.1}ms, segment={:.1}ms, composite={:.1}ms, present={:.1}ms, total={:.1}ms, fps={:.1}",
            self.report.frames_presented,
            capture_ms,
            segment_ms,
            composite_ms,
            present_ms,
            total_ms,
            1000.0 / total_ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Mask};
    use anyhow::bail;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    const W: u32 = 8;
    const H: u32 = 4;
    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<RgbaImage>>>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl OutputSink for RecordingSink {
        fn write_frame(&mut self, frame: &RgbaImage) -> Result<()> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        fn resolution(&self) -> (u32, u32) {
            (W, H)
        }
    }

    /// Returns all-zero masks and stops the stream on call `stop_after`
    struct SequentialProvider {
        stream: MediaStream,
        sink: RecordingSink,
        in_flight: AtomicUsize,
        calls: AtomicUsize,
        stop_after: usize,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl MaskProvider for SequentialProvider {
        async fn segment(&self, frame: &Frame) -> Result<Mask> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(self.in_flight.fetch_add(1, Ordering::SeqCst), 0, "overlapping inference");

            // Every earlier successful cycle was presented before this call
            let failed_before = usize::from(self.fail_on.is_some_and(|n| n < call));
            assert_eq!(self.sink.count(), call - 1 - failed_before);

            tokio::time::sleep(Duration::from_millis(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if call == self.stop_after {
                self.stream.stop_tracks();
            }
            if self.fail_on == Some(call) {
                bail!("inference blew up");
            }
            let (w, h) = frame.dimensions();
            Ok(Mask::filled(w, h, 0))
        }
    }

    fn live_stream() -> MediaStream {
        let stream = MediaStream::new();
        stream.publish(Frame::solid(W, H, RED));
        stream
    }

    fn ready(provider: Arc<dyn MaskProvider>) -> ModelLoad {
        async move { Ok(provider) }.boxed()
    }

    #[test]
    fn scheduler_waits_for_model_after_first_frame() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.handle(RenderEvent::FirstFrame), RenderState::WaitingForFirstFrame);
        assert_eq!(scheduler.handle(RenderEvent::FirstFrame), RenderState::WaitingForFirstFrame);
        assert_eq!(scheduler.handle(RenderEvent::ModelLoaded), RenderState::Running);
    }

    #[test]
    fn scheduler_runs_immediately_when_model_preloaded() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.handle(RenderEvent::ModelLoaded), RenderState::Idle);
        assert_eq!(scheduler.handle(RenderEvent::FirstFrame), RenderState::Running);
    }

    #[test]
    fn first_frame_always_passes_through_waiting() {
        let mut scheduler = Scheduler::new();
        scheduler.handle(RenderEvent::ModelLoaded);
        assert_eq!(scheduler.step(RenderEvent::FirstFrame), RenderState::WaitingForFirstFrame);
        assert_eq!(scheduler.settle(RenderState::WaitingForFirstFrame), RenderState::Running);

        let mut cold = Scheduler::new();
        assert_eq!(cold.step(RenderEvent::FirstFrame), RenderState::WaitingForFirstFrame);
        assert_eq!(cold.settle(RenderState::WaitingForFirstFrame), RenderState::WaitingForFirstFrame);
    }

    #[test]
    fn scheduler_stop_is_terminal() {
        let mut scheduler = Scheduler::new();
        scheduler.handle(RenderEvent::ModelLoaded);
        scheduler.handle(RenderEvent::FirstFrame);
        assert_eq!(scheduler.handle(RenderEvent::StreamEnded), RenderState::Stopped);
        assert_eq!(scheduler.handle(RenderEvent::FirstFrame), RenderState::Stopped);
        assert_eq!(scheduler.handle(RenderEvent::ModelLoaded), RenderState::Stopped);
    }

    #[tokio::test]
    async fn cycles_never_overlap() {
        let stream = live_stream();
        let mut sink = RecordingSink::default();
        let provider = Arc::new(SequentialProvider {
            stream: stream.clone(),
            sink: sink.clone(),
            in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            stop_after: 5,
            fail_on: None,
        });

        let mut render = RenderLoop::new(W, H, RenderOptions::default());
        let report = render.run(&stream, ready(provider.clone()), &mut sink).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
        assert_eq!(report.frames_presented, 4);
        assert_eq!(report.results_discarded, 1);
        assert_eq!(report.final_state, RenderState::Stopped);
        assert!(report.started);
        // Zero mask shows the live frame everywhere
        let frames = sink.frames.lock().unwrap();
        assert!(frames.iter().all(|f| f.pixels().all(|p| p.0 == RED)));
    }

    #[tokio::test]
    async fn inference_failure_drops_only_that_cycle() {
        let stream = live_stream();
        let mut sink = RecordingSink::default();
        let provider = Arc::new(SequentialProvider {
            stream: stream.clone(),
            sink: sink.clone(),
            in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            stop_after: 3,
            fail_on: Some(1),
        });

        let mut render = RenderLoop::new(W, H, RenderOptions::default());
        let report = render.run(&stream, ready(provider), &mut sink).await.unwrap();

        assert_eq!(report.cycles_dropped, 1);
        assert_eq!(report.frames_presented, 1);
        assert_eq!(report.results_discarded, 1);
    }

    struct GatedProvider {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl MaskProvider for GatedProvider {
        async fn segment(&self, frame: &Frame) -> Result<Mask> {
            self.entered.notify_one();
            self.release.notified().await;
            let (w, h) = frame.dimensions();
            Ok(Mask::filled(w, h, 0))
        }
    }

    #[tokio::test]
    async fn pending_result_is_discarded_after_stop() {
        let stream = live_stream();
        let provider = Arc::new(GatedProvider {
            entered: Notify::new(),
            release: Notify::new(),
        });

        let task_stream = stream.clone();
        let task_provider: Arc<dyn MaskProvider> = provider.clone();
        let task = tokio::spawn(async move {
            let mut sink = RecordingSink::default();
            let mut render = RenderLoop::new(W, H, RenderOptions::default());
            render
                .seed_output(RgbaImage::from_pixel(W, H, image::Rgba(BLUE)))
                .unwrap();
            let report = render.run(&task_stream, ready(task_provider), &mut sink).await.unwrap();
            (report, render.output().clone(), sink.count())
        });

        provider.entered.notified().await;
        stream.stop_tracks();
        provider.release.notify_one();

        let (report, output, presented) = task.await.unwrap();
        assert_eq!(report.results_discarded, 1);
        assert_eq!(report.frames_presented, 0);
        assert_eq!(presented, 0);
        assert!(output.pixels().all(|p| p.0 == BLUE));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_model_load_never_starts_compositing() {
        let stream = live_stream();
        let failing: ModelLoad = async { Err(anyhow::anyhow!("model fetch failed")) }.boxed();

        let task_stream = stream.clone();
        let task = tokio::spawn(async move {
            let mut sink = RecordingSink::default();
            let mut render = RenderLoop::new(W, H, RenderOptions::default());
            let report = render.run(&task_stream, failing, &mut sink).await.unwrap();
            (report, sink.count())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished(), "loop should stay in its loading state");
        stream.stop_tracks();

        let (report, presented) = task.await.unwrap();
        assert!(!report.started);
        assert_eq!(report.final_state, RenderState::Stopped);
        assert_eq!(presented, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn model_arriving_late_still_starts_loop() {
        let stream = live_stream();
        let mut sink = RecordingSink::default();
        let provider = Arc::new(SequentialProvider {
            stream: stream.clone(),
            sink: sink.clone(),
            in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            stop_after: 2,
            fail_on: None,
        });
        let late: Arc<dyn MaskProvider> = provider;
        let model: ModelLoad = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(late)
        }
        .boxed();

        let mut render = RenderLoop::new(W, H, RenderOptions::default());
        let report = render.run(&stream, model, &mut sink).await.unwrap();
        assert!(report.started);
        assert_eq!(report.frames_presented, 1);
    }

    struct WrongSizeProvider;

    #[async_trait]
    impl MaskProvider for WrongSizeProvider {
        async fn segment(&self, _frame: &Frame) -> Result<Mask> {
            Ok(Mask::filled(W * 2, H, 0))
        }
    }

    #[tokio::test]
    async fn mask_size_mismatch_stops_loop_with_error() {
        let stream = live_stream();
        let mut sink = RecordingSink::default();
        let mut render = RenderLoop::new(W, H, RenderOptions::default());

        let result = render.run(&stream, ready(Arc::new(WrongSizeProvider)), &mut sink).await;
        assert!(result.is_err());
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_delay_is_interrupted_by_stop() {
        let stream = live_stream();
        let mut sink = RecordingSink::default();
        let provider = Arc::new(SequentialProvider {
            stream: stream.clone(),
            sink: sink.clone(),
            in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            stop_after: usize::MAX,
            fail_on: None,
        });

        let stopper = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.stop_tracks();
        });

        let options = RenderOptions {
            tick_delay: Duration::from_secs(60),
        };
        let mut render = RenderLoop::new(W, H, options);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            render.run(&stream, ready(provider), &mut sink),
        )
        .await
        .expect("stop should cut the tick delay short")
        .unwrap();

        assert_eq!(report.frames_presented, 1);
        assert_eq!(report.final_state, RenderState::Stopped);
    }

    /// Slow failures and slow late results around one quick success
    struct UnevenProvider {
        stream: MediaStream,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MaskProvider for UnevenProvider {
        async fn segment(&self, frame: &Frame) -> Result<Mask> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let (w, h) = frame.dimensions();
            match call {
                1 => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    bail!("inference timed out");
                }
                2 => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(Mask::filled(w, h, 0))
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    self.stream.stop_tracks();
                    Ok(Mask::filled(w, h, 0))
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn segment_timing_counts_presented_frames_only() {
        let stream = live_stream();
        let mut sink = RecordingSink::default();
        let provider = Arc::new(UnevenProvider {
            stream: stream.clone(),
            calls: AtomicUsize::new(0),
        });

        let mut render = RenderLoop::new(W, H, RenderOptions::default());
        let report = render.run(&stream, ready(provider), &mut sink).await.unwrap();

        assert_eq!(report.cycles_dropped, 1);
        assert_eq!(report.frames_presented, 1);
        assert_eq!(report.results_discarded, 1);
        let segment = render.timings.segment;
        assert!(segment >= Duration::from_millis(2), "{segment:?}");
        assert!(segment < Duration::from_millis(100), "{segment:?}");
    }
}
