//! Three-stage streaming pipeline: decode producer, single compute thread
//! (sliding-window orchestrator + interpolation engine), encode consumer.
//!
//! Stages communicate only through two mpsc channels; the read queue is
//! bounded at [`READ_QUEUE_CAPACITY`] so a slow compute thread backpressures
//! the decoder, and the write queue is bounded at [`WRITE_QUEUE_CAPACITY`]
//! (blocking policy) so a slow encoder backpressures compute instead of
//! growing host memory without limit. End-of-stream is signaled by closing
//! the channel (sender drop), which propagates exactly once and can never be
//! mistaken for a frame. A shared cancel flag is checked at every blocking
//! queue operation, and the first stage error cancels the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};

use crate::engine::InterpolationEngine;
use crate::tensor::{align_for_engine, frame_to_tensor, resize_frame};
use crate::types::{Frame, Tensor};

/// Decoded frames buffered ahead of the compute thread.
pub const READ_QUEUE_CAPACITY: usize = 100;
/// Synthesized frames buffered ahead of the encoder.
pub const WRITE_QUEUE_CAPACITY: usize = 256;
/// Output frames between encoder progress reports.
const PROGRESS_REPORT_INTERVAL: u64 = 120;

/// Consumes synthesized frames in order and finalizes the output stream.
pub trait FrameSink: Send + 'static {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// One sliding-window interpolation call: (I0, I1, I2) in, ordered
/// sub-frame sequence out.
pub trait WindowInterpolator: Send + 'static {
    fn interpolate_window(&mut self, i0: &Tensor, i1: &Tensor, i2: &Tensor) -> Result<Vec<Frame>>;
}

impl WindowInterpolator for InterpolationEngine {
    fn interpolate_window(&mut self, i0: &Tensor, i1: &Tensor, i2: &Tensor) -> Result<Vec<Frame>> {
        InterpolationEngine::interpolate_window(self, i0, i1, i2)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub output_width: u32,
    pub output_height: u32,
    pub flow_scale: f32,
    /// Expected output frame count (source frames x multiplier), when the
    /// container reports one. Drives progress percentages.
    pub total_output_frames: Option<u64>,
}

pub struct Pipeline {
    read_capacity: usize,
    write_capacity: usize,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            read_capacity: READ_QUEUE_CAPACITY,
            write_capacity: WRITE_QUEUE_CAPACITY,
        }
    }

    pub fn with_capacities(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            read_capacity: read_capacity.max(1),
            write_capacity: write_capacity.max(1),
        }
    }

    /// Run the full decode -> interpolate -> encode pipeline to completion.
    ///
    /// Returns the first error raised by any stage; a failing stage cancels
    /// the others so the pipeline never stalls on a dead peer.
    pub async fn run<D, W, E>(
        &self,
        decoder: D,
        mut interpolator: W,
        mut encoder: E,
        options: PipelineOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<()>
    where
        D: Iterator<Item = Result<Frame>> + Send + 'static,
        W: WindowInterpolator,
        E: FrameSink,
    {
        if *cancel.borrow() {
            return Ok(());
        }

        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let cancel_state = Arc::new(AtomicBool::new(false));

        let external_cancel_handle = spawn_external_cancel_watcher(cancel, cancel_state.clone());

        let (read_tx, read_rx) = mpsc::channel::<Frame>(self.read_capacity);
        let (write_tx, write_rx) = mpsc::channel::<Frame>(self.write_capacity);

        let mut handles = Vec::new();

        {
            let cancel_state = cancel_state.clone();
            let error_tx = error_tx.clone();
            let mut decoder = decoder;
            handles.push(tokio::task::spawn_blocking(move || {
                let result = run_decoder_loop(&mut decoder, read_tx, &options, &cancel_state);
                if let Err(error) = result {
                    report_task_error(&error_tx, &cancel_state, error.context("decoder stage failed"));
                }
            }));
        }

        {
            let cancel_state = cancel_state.clone();
            let error_tx = error_tx.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let result =
                    run_compute_loop(&mut interpolator, read_rx, write_tx, &options, &cancel_state);
                if let Err(error) = result {
                    report_task_error(
                        &error_tx,
                        &cancel_state,
                        error.context("interpolation stage failed"),
                    );
                }
            }));
        }

        {
            let cancel_state = cancel_state.clone();
            let error_tx = error_tx.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let result = run_encoder_loop(&mut encoder, write_rx, &options, &cancel_state);
                match result {
                    Ok(()) => {
                        if let Err(error) = encoder.finish() {
                            if !cancel_state.load(Ordering::SeqCst) {
                                report_task_error(
                                    &error_tx,
                                    &cancel_state,
                                    error.context("encoder stage failed while finalizing"),
                                );
                            }
                        }
                    }
                    Err(error) => {
                        report_task_error(
                            &error_tx,
                            &cancel_state,
                            error.context("encoder stage failed"),
                        );
                    }
                }
            }));
        }

        drop(error_tx);

        let mut first_error: Option<anyhow::Error> = None;

        for handle in handles {
            if let Err(join_error) = handle.await {
                cancel_state.store(true, Ordering::SeqCst);
                if first_error.is_none() {
                    first_error = Some(anyhow!("pipeline task panicked: {join_error}"));
                }
            }
        }

        while let Some(error) = error_rx.recv().await {
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        cancel_state.store(true, Ordering::SeqCst);
        external_cancel_handle.abort();
        let _ = external_cancel_handle.await;

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_external_cancel_watcher(
    mut cancel: watch::Receiver<bool>,
    cancel_state: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if *cancel.borrow() {
            cancel_state.store(true, Ordering::SeqCst);
            return;
        }

        while cancel.changed().await.is_ok() {
            if *cancel.borrow() {
                cancel_state.store(true, Ordering::SeqCst);
                return;
            }
        }
    })
}

fn report_task_error(
    error_tx: &mpsc::UnboundedSender<anyhow::Error>,
    cancel_state: &Arc<AtomicBool>,
    error: anyhow::Error,
) {
    cancel_state.store(true, Ordering::SeqCst);
    let _ = error_tx.send(error);
}

/// Decode producer: sequential decode order, resize to the output resolution,
/// blocking push onto the bounded read queue.
fn run_decoder_loop<D>(
    decoder: &mut D,
    output: mpsc::Sender<Frame>,
    options: &PipelineOptions,
    cancel_state: &Arc<AtomicBool>,
) -> Result<()>
where
    D: Iterator<Item = Result<Frame>>,
{
    let mut index = 0_u64;

    for frame_result in decoder {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let frame = frame_result.with_context(|| format!("failed to decode frame {index}"))?;
        let frame = resize_frame(&frame, options.output_width, options.output_height);

        if output.blocking_send(frame).is_err() {
            break;
        }
        index = index.saturating_add(1);
    }

    tracing::info!(frames = index, "decoder stage finished");
    Ok(())
}

/// Compute stage: sliding 3-frame window over the decoded stream.
///
/// Head duplicates the first real frame as its own predecessor
/// ((I0, I0, I1)), steady state slides by one frame per call ((I0, I1, I2)),
/// and the tail duplicates the last frame as its own successor
/// ((I0, I1, I1)). Each window's frames are forwarded in order before the
/// next window runs, so no cross-window reordering can occur.
fn run_compute_loop<W>(
    interpolator: &mut W,
    mut input: mpsc::Receiver<Frame>,
    output: mpsc::Sender<Frame>,
    options: &PipelineOptions,
    cancel_state: &Arc<AtomicBool>,
) -> Result<()>
where
    W: WindowInterpolator,
{
    let prepare = |frame: &Frame| -> Result<Tensor> {
        Ok(frame_to_tensor(&align_for_engine(
            frame,
            options.flow_scale,
        )?))
    };

    let Some(first) = input.blocking_recv() else {
        return Ok(());
    };
    let mut i0 = prepare(&first)?;

    let Some(second) = input.blocking_recv() else {
        // Single-frame stream: one fully duplicated window.
        let frames = interpolator.interpolate_window(&i0, &i0, &i0)?;
        forward_window(&output, frames);
        return Ok(());
    };
    let mut i1 = prepare(&second)?;

    let mut windows = 0_u64;

    let head = interpolator
        .interpolate_window(&i0, &i0, &i1)
        .context("head window failed")?;
    if !forward_window(&output, head) {
        return Ok(());
    }
    windows += 1;

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            return Ok(());
        }

        let Some(next) = input.blocking_recv() else {
            break;
        };
        let i2 = prepare(&next)?;

        let frames = interpolator
            .interpolate_window(&i0, &i1, &i2)
            .with_context(|| format!("window {windows} failed"))?;
        if !forward_window(&output, frames) {
            return Ok(());
        }

        i0 = i1;
        i1 = i2;
        windows += 1;
    }

    if !cancel_state.load(Ordering::SeqCst) {
        let tail = interpolator
            .interpolate_window(&i0, &i1, &i1)
            .context("tail window failed")?;
        forward_window(&output, tail);
        windows += 1;
    }

    tracing::info!(windows, "interpolation stage finished");
    Ok(())
}

/// Push one window's frames in order. Returns false when the encoder side
/// has gone away.
fn forward_window(output: &mpsc::Sender<Frame>, frames: Vec<Frame>) -> bool {
    for frame in frames {
        if output.blocking_send(frame).is_err() {
            return false;
        }
    }
    true
}

/// Periodic progress accounting for the encoder stage: one report every
/// [`PROGRESS_REPORT_INTERVAL`] frames, with a completion percentage when the
/// expected output frame count is known.
struct EncodeProgress {
    total: Option<u64>,
    written: u64,
}

impl EncodeProgress {
    fn new(total: Option<u64>) -> Self {
        Self { total, written: 0 }
    }

    /// Count one written frame; returns a report line when one is due.
    fn record(&mut self) -> Option<String> {
        self.written = self.written.saturating_add(1);
        if self.written % PROGRESS_REPORT_INTERVAL != 0 {
            return None;
        }
        Some(self.line())
    }

    fn line(&self) -> String {
        match self.total {
            Some(total) if total > 0 => {
                let percent = self.written as f64 * 100.0 / total as f64;
                format!("{}/{} frames ({percent:.1}%)", self.written, total)
            }
            _ => format!("{} frames", self.written),
        }
    }
}

/// Encode consumer: FIFO pop until channel closure, resize to the output
/// resolution, hand off to the sink.
fn run_encoder_loop<E>(
    encoder: &mut E,
    mut input: mpsc::Receiver<Frame>,
    options: &PipelineOptions,
    cancel_state: &Arc<AtomicBool>,
) -> Result<()>
where
    E: FrameSink,
{
    let mut progress = EncodeProgress::new(options.total_output_frames);

    loop {
        if cancel_state.load(Ordering::SeqCst) {
            break;
        }

        let Some(frame) = input.blocking_recv() else {
            break;
        };

        let frame = resize_frame(&frame, options.output_width, options.output_height);
        encoder
            .write_frame(&frame)
            .with_context(|| format!("failed to encode output frame {}", progress.written))?;
        if let Some(line) = progress.record() {
            tracing::info!("encoded {line}");
        }
    }

    tracing::info!(frames = progress.written, "encoder stage finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::bail;

    use crate::tensor::tensor_to_frame;

    const OPTIONS: PipelineOptions = PipelineOptions {
        output_width: 8,
        output_height: 8,
        flow_scale: 1.0,
        total_output_frames: None,
    };

    fn sample_frame(value: u8) -> Frame {
        Frame::solid(8, 8, [value, value, value])
    }

    fn tensor_tag(tensor: &Tensor) -> u8 {
        (tensor[[0, 0, 0, 0]] * 255.0).round() as u8
    }

    /// Records every window triple (tagged by first pixel value) and emits
    /// `times` frames whose pixel value encodes emission order.
    struct RecordingInterpolator {
        times: usize,
        triples: Arc<Mutex<Vec<(u8, u8, u8)>>>,
        emitted: u8,
        delay: Duration,
    }

    impl RecordingInterpolator {
        fn new(times: usize) -> (Self, Arc<Mutex<Vec<(u8, u8, u8)>>>) {
            let triples = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    times,
                    triples: triples.clone(),
                    emitted: 0,
                    delay: Duration::ZERO,
                },
                triples,
            )
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl WindowInterpolator for RecordingInterpolator {
        fn interpolate_window(
            &mut self,
            i0: &Tensor,
            i1: &Tensor,
            i2: &Tensor,
        ) -> Result<Vec<Frame>> {
            if self.delay > Duration::ZERO {
                std::thread::sleep(self.delay);
            }

            self.triples
                .lock()
                .expect("triples mutex poisoned")
                .push((tensor_tag(i0), tensor_tag(i1), tensor_tag(i2)));

            let mut frames = Vec::with_capacity(self.times);
            for _ in 0..self.times {
                frames.push(sample_frame(self.emitted));
                self.emitted = self.emitted.wrapping_add(1);
            }
            Ok(frames)
        }
    }

    /// Emits the middle frame unchanged (times = 1 behavior).
    struct PassthroughInterpolator;

    impl WindowInterpolator for PassthroughInterpolator {
        fn interpolate_window(
            &mut self,
            _i0: &Tensor,
            i1: &Tensor,
            _i2: &Tensor,
        ) -> Result<Vec<Frame>> {
            Ok(vec![tensor_to_frame(i1)])
        }
    }

    #[derive(Clone)]
    struct SinkState {
        values: Arc<Mutex<Vec<u8>>>,
        written: Arc<AtomicUsize>,
        finished: Arc<AtomicBool>,
    }

    impl SinkState {
        fn new() -> Self {
            Self {
                values: Arc::new(Mutex::new(Vec::new())),
                written: Arc::new(AtomicUsize::new(0)),
                finished: Arc::new(AtomicBool::new(false)),
            }
        }

        fn values(&self) -> Vec<u8> {
            self.values.lock().expect("values mutex poisoned").clone()
        }
    }

    struct CollectingSink {
        state: SinkState,
        delay: Duration,
    }

    impl CollectingSink {
        fn new(state: SinkState) -> Self {
            Self {
                state,
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl FrameSink for CollectingSink {
        fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            if self.delay > Duration::ZERO {
                std::thread::sleep(self.delay);
            }
            self.state
                .values
                .lock()
                .expect("values mutex poisoned")
                .push(frame.data[0]);
            self.state.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.state.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sliding_window_head_steady_tail() {
        let frames = (0_u8..4).map(sample_frame).map(Ok);
        let (interpolator, triples) = RecordingInterpolator::new(2);
        let state = SinkState::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        Pipeline::new()
            .run(
                frames,
                interpolator,
                CollectingSink::new(state.clone()),
                OPTIONS,
                cancel_rx,
            )
            .await
            .expect("pipeline should complete");

        let recorded = triples.lock().expect("triples mutex poisoned").clone();
        assert_eq!(
            recorded,
            vec![(0, 0, 1), (0, 1, 2), (1, 2, 3), (2, 3, 3)],
            "head duplicates first frame, window slides by one, tail duplicates last"
        );
    }

    #[tokio::test]
    async fn test_output_order_is_monotonic() {
        let frames = (0_u8..4).map(sample_frame).map(Ok);
        let (interpolator, _) = RecordingInterpolator::new(3);
        let state = SinkState::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        Pipeline::new()
            .run(
                frames,
                interpolator,
                CollectingSink::new(state.clone()),
                OPTIONS,
                cancel_rx,
            )
            .await
            .expect("pipeline should complete");

        let values = state.values();
        // 4 windows x 3 frames, emitted with increasing tags.
        assert_eq!(values.len(), 12);
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1], "out-of-order output: {values:?}");
        }
        assert!(state.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_backpressure_bounds_producer_lead() {
        struct CountingSource {
            total: u64,
            next: u64,
            produced: Arc<AtomicUsize>,
            written: Arc<AtomicUsize>,
            max_lag: Arc<AtomicUsize>,
        }

        impl Iterator for CountingSource {
            type Item = Result<Frame>;

            fn next(&mut self) -> Option<Self::Item> {
                if self.next >= self.total {
                    return None;
                }
                let produced = self.produced.fetch_add(1, Ordering::SeqCst) + 1;
                let written = self.written.load(Ordering::SeqCst);
                let lag = produced.saturating_sub(written);

                let mut current = self.max_lag.load(Ordering::SeqCst);
                while lag > current {
                    match self.max_lag.compare_exchange(
                        current,
                        lag,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => break,
                        Err(new_current) => current = new_current,
                    }
                }

                let frame = sample_frame((self.next % 250) as u8);
                self.next += 1;
                Some(Ok(frame))
            }
        }

        let state = SinkState::new();
        let produced = Arc::new(AtomicUsize::new(0));
        let max_lag = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            total: 40,
            next: 0,
            produced: produced.clone(),
            written: state.written.clone(),
            max_lag: max_lag.clone(),
        };

        let sink = CollectingSink::new(state.clone()).with_delay(Duration::from_millis(3));
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        Pipeline::with_capacities(2, 2)
            .run(source, PassthroughInterpolator, sink, OPTIONS, cancel_rx)
            .await
            .expect("pipeline should complete");

        assert_eq!(produced.load(Ordering::SeqCst), 40);
        assert_eq!(state.written.load(Ordering::SeqCst), 40);

        // Producer can lead by at most the two queue capacities plus the
        // window (3 frames) and the in-flight frame per stage.
        let observed = max_lag.load(Ordering::SeqCst);
        assert!(
            observed <= 10,
            "expected bounded backpressure, observed lag={observed}"
        );
    }

    #[tokio::test]
    async fn test_decode_error_fails_pipeline() {
        let frames = (0_u8..10).map(|i| {
            if i == 5 {
                bail!("injected decode failure")
            } else {
                Ok(sample_frame(i))
            }
        });

        let (interpolator, _) = RecordingInterpolator::new(2);
        let state = SinkState::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = Pipeline::new()
            .run(
                frames,
                interpolator,
                CollectingSink::new(state),
                OPTIONS,
                cancel_rx,
            )
            .await;

        let error = result.err().expect("pipeline should fail");
        let message = format!("{error:#}");
        assert!(
            message.contains("decoder stage failed"),
            "unexpected error: {message}"
        );
    }

    #[tokio::test]
    async fn test_interpolator_error_fails_pipeline() {
        struct FailingInterpolator;

        impl WindowInterpolator for FailingInterpolator {
            fn interpolate_window(
                &mut self,
                _i0: &Tensor,
                _i1: &Tensor,
                _i2: &Tensor,
            ) -> Result<Vec<Frame>> {
                bail!("injected engine failure")
            }
        }

        let frames = (0_u8..10).map(sample_frame).map(Ok);
        let state = SinkState::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let result = Pipeline::new()
            .run(
                frames,
                FailingInterpolator,
                CollectingSink::new(state),
                OPTIONS,
                cancel_rx,
            )
            .await;

        let error = result.err().expect("pipeline should fail");
        assert!(format!("{error:#}").contains("interpolation stage failed"));
    }

    #[tokio::test]
    async fn test_cancel_stops_pipeline() {
        let frames = (0_u64..100_000).map(|i| Ok(sample_frame((i % 250) as u8)));
        let (interpolator, _) = RecordingInterpolator::new(2);
        let interpolator = interpolator.with_delay(Duration::from_millis(2));
        let state = SinkState::new();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let _ = cancel_tx.send(true);
        });

        Pipeline::new()
            .run(
                frames,
                interpolator,
                CollectingSink::new(state.clone()),
                OPTIONS,
                cancel_rx,
            )
            .await
            .expect("canceled pipeline should exit cleanly");

        assert!(state.written.load(Ordering::SeqCst) < 200_000);
    }

    #[tokio::test]
    async fn test_empty_stream_completes() {
        let frames = std::iter::empty::<Result<Frame>>();
        let (interpolator, triples) = RecordingInterpolator::new(2);
        let state = SinkState::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        Pipeline::new()
            .run(
                frames,
                interpolator,
                CollectingSink::new(state.clone()),
                OPTIONS,
                cancel_rx,
            )
            .await
            .expect("empty pipeline should complete");

        assert!(triples.lock().expect("triples mutex poisoned").is_empty());
        assert_eq!(state.written.load(Ordering::SeqCst), 0);
        assert!(state.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_encode_progress_reports_on_interval() {
        let mut progress = EncodeProgress::new(Some(PROGRESS_REPORT_INTERVAL * 2));

        for _ in 0..PROGRESS_REPORT_INTERVAL - 1 {
            assert_eq!(progress.record(), None);
        }
        assert_eq!(
            progress.record().as_deref(),
            Some("120/240 frames (50.0%)")
        );

        for _ in 0..PROGRESS_REPORT_INTERVAL - 1 {
            assert_eq!(progress.record(), None);
        }
        assert_eq!(
            progress.record().as_deref(),
            Some("240/240 frames (100.0%)")
        );
    }

    #[test]
    fn test_encode_progress_without_known_total() {
        let mut progress = EncodeProgress::new(None);
        for _ in 0..PROGRESS_REPORT_INTERVAL - 1 {
            assert_eq!(progress.record(), None);
        }
        assert_eq!(progress.record().as_deref(), Some("120 frames"));
    }

    #[tokio::test]
    async fn test_single_frame_stream_runs_one_window() {
        let frames = std::iter::once(Ok(sample_frame(7)));
        let (interpolator, triples) = RecordingInterpolator::new(3);
        let state = SinkState::new();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        Pipeline::new()
            .run(
                frames,
                interpolator,
                CollectingSink::new(state.clone()),
                OPTIONS,
                cancel_rx,
            )
            .await
            .expect("pipeline should complete");

        let recorded = triples.lock().expect("triples mutex poisoned").clone();
        assert_eq!(recorded, vec![(7, 7, 7)]);
        assert_eq!(state.written.load(Ordering::SeqCst), 3);
    }
}
