//! Reconnecting frame source.
//!
//! [`FrameSource`] wraps anything that can [`Acquire`] a [`BatchStream`] and
//! turns connection loss, reader errors and stalls into a resumable pull:
//! every call to [`FrameSource::next`] yields a batch, an `Unavailable` notice
//! (after which the next call backs off and reconnects), end of stream for
//! finite sources, or `Stopped` once the stop flag is raised.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    sidecar::BatchStream,
    types::{IngestError, ObservationBatch},
};

/// Granularity at which blocking waits re-check the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Something that can open a fresh batch stream.
pub trait Acquire {
    fn connect(&mut self) -> Result<BatchStream, IngestError>;

    /// Human-readable description for logs and the status endpoint.
    fn label(&self) -> String;

    /// Finite sources report end of stream when their reader closes instead
    /// of reconnecting.
    fn is_finite(&self) -> bool {
        false
    }
}

/// Exponential reconnect delay, capped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt following the `attempt`-th consecutive
    /// failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Connecting,
    Streaming,
    Backoff,
    Ended,
    Stopped,
}

#[derive(Debug)]
pub enum SourceEvent {
    Batch(ObservationBatch),
    /// The source is down. The next call waits `retry_in` and reconnects.
    Unavailable {
        attempt: u32,
        retry_in: Duration,
        reason: String,
    },
    EndOfStream,
    Stopped,
}

pub struct FrameSource<A: Acquire> {
    acquire: A,
    backoff: BackoffPolicy,
    stall_timeout: Option<Duration>,
    stop: Arc<AtomicBool>,
    stream: Option<BatchStream>,
    pending_delay: Option<Duration>,
    failures: u32,
    reconnects: u64,
    connected_once: bool,
    state: SourceState,
}

impl<A: Acquire> FrameSource<A> {
    pub fn new(acquire: A, backoff: BackoffPolicy, stop: Arc<AtomicBool>) -> Self {
        Self {
            acquire,
            backoff,
            stall_timeout: None,
            stop,
            stream: None,
            pending_delay: None,
            failures: 0,
            reconnects: 0,
            connected_once: false,
            state: SourceState::Connecting,
        }
    }

    /// Treat a connected stream that yields nothing for `timeout` as lost.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Successful connections after the first one.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn label(&self) -> String {
        self.acquire.label()
    }

    /// Pull the next event. Blocks while waiting for data or backing off.
    pub fn next(&mut self) -> SourceEvent {
        if self.stop.load(Ordering::SeqCst) {
            return self.halt();
        }
        if self.state == SourceState::Ended {
            return SourceEvent::EndOfStream;
        }

        if let Some(delay) = self.pending_delay.take() {
            self.state = SourceState::Backoff;
            if !self.sleep_unless_stopped(delay) {
                return self.halt();
            }
        }

        if self.stream.is_none() {
            self.state = SourceState::Connecting;
            match self.acquire.connect() {
                Ok(stream) => {
                    if self.connected_once {
                        self.reconnects += 1;
                        info!(
                            source = %self.acquire.label(),
                            reconnects = self.reconnects,
                            "source reconnected"
                        );
                    }
                    self.connected_once = true;
                    self.stream = Some(stream);
                    self.state = SourceState::Streaming;
                }
                Err(err) => return self.fail(error_chain(&err)),
            }
        }

        self.receive()
    }

    fn receive(&mut self) -> SourceEvent {
        let started = Instant::now();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return self.halt();
            }
            let Some(stream) = self.stream.as_ref() else {
                return self.fail("no stream".to_string());
            };

            match stream.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(batch)) => {
                    self.failures = 0;
                    return SourceEvent::Batch(batch);
                }
                Ok(Err(err)) => {
                    // A finite source is never reconnected.
                    if self.acquire.is_finite() {
                        warn!(
                            source = %self.acquire.label(),
                            "source read failed, ending stream: {}",
                            error_chain(&err)
                        );
                        return self.end_of_stream();
                    }
                    return self.fail(error_chain(&err));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(limit) = self.stall_timeout {
                        if started.elapsed() >= limit {
                            let err = IngestError::Stalled(limit.as_millis() as u64);
                            return self.fail(err.to_string());
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if self.acquire.is_finite() {
                        info!(source = %self.acquire.label(), "source reached end of stream");
                        return self.end_of_stream();
                    }
                    return self.fail("source closed its output".to_string());
                }
            }
        }
    }

    fn fail(&mut self, reason: String) -> SourceEvent {
        self.stream = None;
        self.failures = self.failures.saturating_add(1);
        let retry_in = self.backoff.delay(self.failures);
        self.pending_delay = Some(retry_in);
        self.state = SourceState::Backoff;
        warn!(
            source = %self.acquire.label(),
            attempt = self.failures,
            retry_ms = retry_in.as_millis() as u64,
            "source unavailable: {reason}"
        );
        SourceEvent::Unavailable {
            attempt: self.failures,
            retry_in,
            reason,
        }
    }

    fn end_of_stream(&mut self) -> SourceEvent {
        self.stream = None;
        self.state = SourceState::Ended;
        SourceEvent::EndOfStream
    }

    fn halt(&mut self) -> SourceEvent {
        self.stream = None;
        self.pending_delay = None;
        self.state = SourceState::Stopped;
        SourceEvent::Stopped
    }

    /// Returns `false` if the stop flag was raised before `delay` elapsed.
    fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

fn error_chain(err: &IngestError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crossbeam_channel::{Sender, bounded};

    use super::*;

    enum Step {
        Fail,
        Batches(Vec<ObservationBatch>),
        /// Batches followed by a read error.
        BatchesThenError(Vec<ObservationBatch>),
        Hang,
    }

    struct Scripted {
        steps: VecDeque<Step>,
        finite: bool,
        held: Vec<Sender<Result<ObservationBatch, IngestError>>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                finite: false,
                held: Vec::new(),
            }
        }
    }

    impl Acquire for Scripted {
        fn connect(&mut self) -> Result<BatchStream, IngestError> {
            match self.steps.pop_front() {
                Some(Step::Batches(batches)) => {
                    let (tx, rx) = bounded(batches.len().max(1));
                    for batch in batches {
                        tx.send(Ok(batch)).unwrap();
                    }
                    Ok(BatchStream::from_receiver(rx))
                }
                Some(Step::BatchesThenError(batches)) => {
                    let (tx, rx) = bounded(batches.len() + 1);
                    for batch in batches {
                        tx.send(Ok(batch)).unwrap();
                    }
                    tx.send(Err(IngestError::Other(anyhow::anyhow!("bad read"))))
                        .unwrap();
                    Ok(BatchStream::from_receiver(rx))
                }
                Some(Step::Hang) => {
                    let (tx, rx) = bounded(1);
                    self.held.push(tx);
                    Ok(BatchStream::from_receiver(rx))
                }
                Some(Step::Fail) | None => Err(IngestError::Other(anyhow::anyhow!("refused"))),
            }
        }

        fn label(&self) -> String {
            "scripted".to_string()
        }

        fn is_finite(&self) -> bool {
            self.finite
        }
    }

    fn batch(frame: u64) -> ObservationBatch {
        ObservationBatch {
            frame: Some(frame),
            ..ObservationBatch::default()
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    fn frame_of(event: SourceEvent) -> Option<u64> {
        match event {
            SourceEvent::Batch(batch) => batch.frame,
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn recovers_from_failures_and_disconnects() {
        let script = Scripted::new(vec![
            Step::Fail,
            Step::Batches(vec![batch(1)]),
            Step::Batches(vec![batch(2)]),
        ]);
        let mut source = FrameSource::new(script, fast_backoff(), Arc::new(AtomicBool::new(false)));

        assert!(matches!(
            source.next(),
            SourceEvent::Unavailable { attempt: 1, .. }
        ));
        assert_eq!(source.state(), SourceState::Backoff);
        assert_eq!(frame_of(source.next()), Some(1));
        assert_eq!(source.state(), SourceState::Streaming);

        // Reader closed: unavailable again, failure count restarted by the batch.
        assert!(matches!(
            source.next(),
            SourceEvent::Unavailable { attempt: 1, .. }
        ));
        assert_eq!(frame_of(source.next()), Some(2));
        assert_eq!(source.reconnects(), 1);
        assert_eq!(source.consecutive_failures(), 0);
    }

    #[test]
    fn consecutive_failures_grow_the_delay() {
        let script = Scripted::new(vec![Step::Fail, Step::Fail, Step::Fail]);
        let mut source = FrameSource::new(script, fast_backoff(), Arc::new(AtomicBool::new(false)));
        let delays: Vec<_> = (0..3)
            .map(|_| match source.next() {
                SourceEvent::Unavailable { retry_in, .. } => retry_in,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4)
            ]
        );
    }

    #[test]
    fn finite_source_ends() {
        let mut script = Scripted::new(vec![Step::Batches(vec![batch(1), batch(2)])]);
        script.finite = true;
        let mut source = FrameSource::new(script, fast_backoff(), Arc::new(AtomicBool::new(false)));
        assert_eq!(frame_of(source.next()), Some(1));
        assert_eq!(frame_of(source.next()), Some(2));
        assert!(matches!(source.next(), SourceEvent::EndOfStream));
        assert!(matches!(source.next(), SourceEvent::EndOfStream));
        assert_eq!(source.state(), SourceState::Ended);
    }

    #[test]
    fn read_error_ends_a_finite_source() {
        let mut script = Scripted::new(vec![
            Step::BatchesThenError(vec![batch(1)]),
            Step::Batches(vec![batch(1)]),
        ]);
        script.finite = true;
        let mut source = FrameSource::new(script, fast_backoff(), Arc::new(AtomicBool::new(false)));
        assert_eq!(frame_of(source.next()), Some(1));
        assert!(matches!(source.next(), SourceEvent::EndOfStream));
        assert!(matches!(source.next(), SourceEvent::EndOfStream));
        assert_eq!(source.reconnects(), 0);
    }

    #[test]
    fn read_error_reconnects_a_live_source() {
        let script = Scripted::new(vec![
            Step::BatchesThenError(vec![batch(1)]),
            Step::Batches(vec![batch(2)]),
        ]);
        let mut source = FrameSource::new(script, fast_backoff(), Arc::new(AtomicBool::new(false)));
        assert_eq!(frame_of(source.next()), Some(1));
        assert!(matches!(source.next(), SourceEvent::Unavailable { .. }));
        assert_eq!(frame_of(source.next()), Some(2));
        assert_eq!(source.reconnects(), 1);
    }

    #[test]
    fn stall_counts_as_unavailable() {
        let script = Scripted::new(vec![Step::Hang, Step::Batches(vec![batch(7)])]);
        let mut source = FrameSource::new(script, fast_backoff(), Arc::new(AtomicBool::new(false)))
            .with_stall_timeout(Duration::from_millis(50));
        match source.next() {
            SourceEvent::Unavailable { reason, .. } => assert!(reason.contains("stalled")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(frame_of(source.next()), Some(7));
    }

    #[test]
    fn stop_flag_interrupts_backoff() {
        let stop = Arc::new(AtomicBool::new(false));
        let policy = BackoffPolicy {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(60),
        };
        let mut source = FrameSource::new(Scripted::new(vec![Step::Fail]), policy, stop.clone());
        assert!(matches!(source.next(), SourceEvent::Unavailable { .. }));

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.store(true, Ordering::SeqCst);
        });
        let started = Instant::now();
        assert!(matches!(source.next(), SourceEvent::Stopped));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(source.state(), SourceState::Stopped);
        setter.join().unwrap();
    }

    #[test]
    fn stop_flag_wins_over_pending_data() {
        let stop = Arc::new(AtomicBool::new(true));
        let mut source = FrameSource::new(
            Scripted::new(vec![Step::Batches(vec![batch(1)])]),
            fast_backoff(),
            stop,
        );
        assert!(matches!(source.next(), SourceEvent::Stopped));
    }
}
