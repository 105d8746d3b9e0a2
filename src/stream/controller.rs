//! # Stream Controller
//!
//! Explicit state machine driving one inbound audio stream through the resampler
//! and its recognition session.
//!
//! ## States:
//! ```text
//! Idle ──data──▶ Streaming ──end──▶ Draining ──▶ Closed
//!   │               │
//!   │               └──error / client gone──▶ Error ──▶ Closed
//!   ├──end──▶ Draining ──▶ Closed
//!   ├──error──▶ Error ──▶ Closed
//!   └──engine unavailable──▶ Closed
//! ```
//!
//! ## Channels:
//! - **events in**: any `Stream<Item = StreamEvent>`; the end of the stream counts as `End`
//! - **start signal out**: a oneshot telling the transport whether to start a
//!   streaming response or to answer with an error status
//! - **fragments out**: an unbounded channel of transcript fragments, written
//!   eagerly in the order the recognizer produced them
//!
//! Events are handled one at a time; the next event is not read until the
//! current chunk has been resampled and recognized or dropped.

use crate::audio::upsample;
use crate::error::{AppError, AppResult};
use crate::recognition::{ModelProvider, RecognitionSession, TranscriptFragment};
use actix_web::web::Bytes;
use futures_util::{Stream, StreamExt};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Transport-level events for one stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A raw 8 kHz PCM chunk of any size
    Data(Bytes),
    /// The client finished sending
    End,
    /// The inbound stream failed
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
    Draining,
    Error,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::Draining => "draining",
            StreamState::Error => "error",
            StreamState::Closed => "closed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Idle, Streaming)
                | (Idle, Draining)
                | (Idle, Error)
                | (Idle, Closed)
                | (Streaming, Draining)
                | (Streaming, Error)
                | (Draining, Closed)
                | (Error, Closed)
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Client finished sending and the session drained normally
    Completed,
    /// The recognition session could not be opened
    Rejected(AppError),
    /// The inbound stream or the controller failed
    Failed(AppError),
    /// The client stopped reading the response
    Cancelled,
}

/// Counters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub chunks_received: u64,
    pub chunks_processed: u64,
    pub chunks_skipped: u64,
    pub chunks_dropped: u64,
    pub fragments_sent: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Final report returned by [`StreamController::run`].
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub stream_id: String,
    pub final_state: StreamState,
    pub outcome: StreamOutcome,
    pub stats: StreamStats,
    pub duration: Duration,
}

/// Receiving ends handed to the transport.
pub struct StreamHandles {
    /// Resolves once the response can start (`Ok`) or must be an error response
    pub start: oneshot::Receiver<AppResult<()>>,
    /// Transcript fragments in production order; closes when the stream ends
    pub fragments: mpsc::UnboundedReceiver<TranscriptFragment>,
}

/// State machine for one connection.
pub struct StreamController {
    stream_id: String,
    state: StreamState,
    provider: ModelProvider,
    session: Option<RecognitionSession>,
    start: Option<oneshot::Sender<AppResult<()>>>,
    fragments: Option<mpsc::UnboundedSender<TranscriptFragment>>,
    outcome: Option<StreamOutcome>,
    stats: StreamStats,
    started_at: Instant,
}

/// Result of handing one chunk to the blocking recognizer thread.
struct ChunkOutcome {
    session: RecognitionSession,
    resampled_len: usize,
    result: AppResult<Option<TranscriptFragment>>,
}

impl StreamController {
    pub fn new(stream_id: impl Into<String>, provider: ModelProvider) -> (Self, StreamHandles) {
        let (start_tx, start_rx) = oneshot::channel();
        let (fragment_tx, fragment_rx) = mpsc::unbounded_channel();
        let controller = Self {
            stream_id: stream_id.into(),
            state: StreamState::Idle,
            provider,
            session: None,
            start: Some(start_tx),
            fragments: Some(fragment_tx),
            outcome: None,
            stats: StreamStats::default(),
            started_at: Instant::now(),
        };
        let handles = StreamHandles {
            start: start_rx,
            fragments: fragment_rx,
        };
        (controller, handles)
    }

    #[cfg(test)]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[cfg(test)]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Drive the stream until it reaches `Closed`.
    ///
    /// The event stream is dropped as soon as the controller closes, so no chunk
    /// is read or processed after an end, error or cancellation.
    pub async fn run<S>(mut self, mut events: S) -> StreamSummary
    where
        S: Stream<Item = StreamEvent> + Unpin,
    {
        while self.state != StreamState::Closed {
            let event = events.next().await.unwrap_or(StreamEvent::End);
            self.handle(event).await;
        }
        drop(events);

        let summary = StreamSummary {
            stream_id: self.stream_id.clone(),
            final_state: self.state,
            outcome: self.outcome.take().unwrap_or(StreamOutcome::Completed),
            stats: self.stats.clone(),
            duration: self.started_at.elapsed(),
        };
        info!(
            stream_id = %summary.stream_id,
            state = %summary.final_state,
            outcome = ?summary.outcome,
            chunks = summary.stats.chunks_received,
            skipped = summary.stats.chunks_skipped,
            dropped = summary.stats.chunks_dropped,
            fragments = summary.stats.fragments_sent,
            bytes_in = summary.stats.bytes_in,
            bytes_out = summary.stats.bytes_out,
            duration_ms = summary.duration.as_millis() as u64,
            "Audio stream closed"
        );
        summary
    }

    /// Apply one event to the state machine.
    pub async fn handle(&mut self, event: StreamEvent) {
        match (self.state, event) {
            (StreamState::Idle, StreamEvent::Data(chunk)) => {
                if chunk.is_empty() {
                    return;
                }
                self.open_session().await;
                if self.state == StreamState::Streaming {
                    self.process_chunk(chunk).await;
                }
            }
            (StreamState::Streaming, StreamEvent::Data(chunk)) => {
                if self.client_gone() {
                    self.cancel();
                    return;
                }
                self.process_chunk(chunk).await;
            }
            (StreamState::Idle | StreamState::Streaming, StreamEvent::End) => self.drain(),
            (StreamState::Idle | StreamState::Streaming, StreamEvent::Error(message)) => {
                self.fail(AppError::Transport(message))
            }
            (state, event) => {
                debug!(stream_id = %self.stream_id, %state, ?event, "Ignoring event");
            }
        }
    }

    fn transition(&mut self, next: StreamState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid stream transition {} -> {}",
            self.state,
            next
        );
        debug!(stream_id = %self.stream_id, from = %self.state, to = %next, "Stream state change");
        self.state = next;
    }

    /// Idle → Streaming, or Idle → Closed when the engine is unavailable.
    async fn open_session(&mut self) {
        let opened = match self.provider.get().await {
            Ok(model) => {
                let stream_id = self.stream_id.clone();
                tokio::task::spawn_blocking(move || RecognitionSession::open(&model, &stream_id))
                    .await
                    .unwrap_or_else(|e| {
                        Err(AppError::EngineUnavailable(format!(
                            "recognizer setup task failed: {}",
                            e
                        )))
                    })
            }
            Err(e) => Err(e),
        };

        match opened {
            Ok(session) => {
                self.session = Some(session);
                self.signal_start(Ok(()));
                self.transition(StreamState::Streaming);
            }
            Err(e) => {
                error!(stream_id = %self.stream_id, error = %e, "Could not open recognition session");
                self.signal_start(Err(e.clone()));
                self.fragments = None;
                self.outcome = Some(StreamOutcome::Rejected(e));
                self.transition(StreamState::Closed);
            }
        }
    }

    /// Resample one chunk, feed it to the recognizer, forward any fragment.
    ///
    /// Failures are logged and the chunk is dropped; the stream stays in
    /// `Streaming`.
    async fn process_chunk(&mut self, chunk: Bytes) {
        let original_len = chunk.len();
        self.stats.chunks_received += 1;
        self.stats.bytes_in += original_len as u64;

        let Some(mut session) = self.session.take() else {
            self.fail(AppError::Internal("streaming without a recognition session".into()));
            return;
        };

        let joined = tokio::task::spawn_blocking(move || {
            let resampled = upsample(&chunk);
            let result = if resampled.is_empty() {
                Ok(None)
            } else {
                catch_unwind(AssertUnwindSafe(|| session.push_samples(&resampled)))
                    .unwrap_or_else(|panic| {
                        Err(AppError::ChunkProcessing(format!(
                            "recognizer panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    })
            };
            ChunkOutcome {
                session,
                resampled_len: resampled.len(),
                result,
            }
        })
        .await;

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                // The session went down with the task and has been released.
                self.fail(AppError::Internal(format!("chunk task failed: {}", e)));
                return;
            }
        };
        self.session = Some(outcome.session);

        match outcome.result {
            Ok(_) if outcome.resampled_len == 0 => {
                warn!(
                    stream_id = %self.stream_id,
                    original_bytes = original_len,
                    "Upsampled chunk is empty, skipping"
                );
                self.stats.chunks_skipped += 1;
            }
            Ok(fragment) => {
                self.stats.chunks_processed += 1;
                if let Some(fragment) = fragment {
                    self.emit(fragment);
                }
            }
            Err(e) => {
                warn!(
                    stream_id = %self.stream_id,
                    original_bytes = original_len,
                    resampled_bytes = outcome.resampled_len,
                    error = %e,
                    "Error processing audio chunk, dropping it"
                );
                self.stats.chunks_dropped += 1;
            }
        }
    }

    fn emit(&mut self, fragment: TranscriptFragment) {
        info!(stream_id = %self.stream_id, text = %fragment, "Transcript fragment");
        let len = fragment.as_str().len() as u64;
        let delivered = self
            .fragments
            .as_ref()
            .map(|tx| tx.send(fragment).is_ok())
            .unwrap_or(false);

        if delivered {
            self.stats.fragments_sent += 1;
            self.stats.bytes_out += len;
        } else {
            self.cancel();
        }
    }

    /// Idle/Streaming → Draining → Closed.
    fn drain(&mut self) {
        self.transition(StreamState::Draining);
        info!(stream_id = %self.stream_id, "Audio stream ended");
        self.close_session();
        // An empty stream still gets an (empty) streaming response.
        self.signal_start(Ok(()));
        self.fragments = None;
        self.outcome = Some(StreamOutcome::Completed);
        self.transition(StreamState::Closed);
    }

    /// Idle/Streaming → Error → Closed.
    fn fail(&mut self, err: AppError) {
        self.transition(StreamState::Error);
        error!(stream_id = %self.stream_id, error = %err, "Audio stream failed");
        if self.response_started() {
            debug!(stream_id = %self.stream_id, "Response already started, terminating body");
        } else {
            self.signal_start(Err(err.clone()));
        }
        self.fragments = None;
        self.close_session();
        self.outcome = Some(StreamOutcome::Failed(err));
        self.transition(StreamState::Closed);
    }

    /// Streaming → Error → Closed when nobody reads the response any more.
    fn cancel(&mut self) {
        if self.state != StreamState::Streaming {
            return;
        }
        self.transition(StreamState::Error);
        warn!(stream_id = %self.stream_id, "Client stopped reading, cancelling stream");
        self.fragments = None;
        self.close_session();
        self.outcome = Some(StreamOutcome::Cancelled);
        self.transition(StreamState::Closed);
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn signal_start(&mut self, result: AppResult<()>) {
        if let Some(tx) = self.start.take() {
            // The transport may already be gone; nothing to report to then.
            let _ = tx.send(result);
        }
    }

    fn response_started(&self) -> bool {
        self.start.is_none()
    }

    fn client_gone(&self) -> bool {
        self.fragments.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.close_session();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::samples_to_bytes;
    use crate::recognition::scripted::{ScriptedModel, ScriptedStep};
    use crate::recognition::SpeechModel;
    use futures_util::stream;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn controller_for(model: Arc<dyn SpeechModel>) -> (StreamController, StreamHandles) {
        StreamController::new("test-stream", ModelProvider::with_model(model))
    }

    fn chunk(samples: &[i16]) -> StreamEvent {
        StreamEvent::Data(Bytes::from(samples_to_bytes(samples)))
    }

    fn drain_fragments(handles: &mut StreamHandles) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(fragment) = handles.fragments.try_recv() {
            out.push(fragment.into_string());
        }
        out
    }

    #[test]
    fn test_transition_table() {
        use StreamState::*;
        assert!(Idle.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Draining));
        assert!(Streaming.can_transition_to(Error));
        assert!(Draining.can_transition_to(Closed));
        assert!(Error.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Streaming));
        assert!(!Draining.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Idle));
    }

    #[tokio::test]
    async fn test_silence_produces_no_fragments() {
        let scripted = ScriptedModel::new(vec![]);
        let (controller, mut handles) = controller_for(scripted.clone());

        let events = stream::iter(vec![
            StreamEvent::Data(Bytes::from(vec![0u8; 320])),
            StreamEvent::Data(Bytes::from(vec![0u8; 640])),
            StreamEvent::Data(Bytes::from(vec![0u8; 160])),
            StreamEvent::End,
        ]);
        let summary = controller.run(events).await;

        assert_eq!(handles.start.try_recv().unwrap(), Ok(()));
        assert!(drain_fragments(&mut handles).is_empty());
        assert_eq!(summary.final_state, StreamState::Closed);
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(summary.stats.chunks_processed, 3);
        assert_eq!(summary.stats.chunks_dropped, 0);
        assert_eq!(summary.stats.bytes_in, 1120);

        let probe = scripted.probe();
        assert_eq!(probe.samples_seen.load(Ordering::SeqCst), 1120);
        assert_eq!(probe.created.load(Ordering::SeqCst), 1);
        assert_eq!(probe.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fragments_follow_chunk_order() {
        let scripted = ScriptedModel::new(vec![
            ScriptedStep::Pending,
            ScriptedStep::Complete("hello".into()),
            ScriptedStep::Complete("".into()),
            ScriptedStep::Complete("world".into()),
        ]);
        let (controller, mut handles) = controller_for(scripted.clone());

        let events = stream::iter(vec![
            chunk(&[1, 2]),
            chunk(&[3, 4]),
            chunk(&[5, 6]),
            chunk(&[7, 8]),
        ]);
        let summary = controller.run(events).await;

        assert_eq!(drain_fragments(&mut handles), vec!["hello", "world"]);
        assert_eq!(summary.stats.fragments_sent, 2);
        assert_eq!(summary.stats.bytes_out, 10);
        assert_eq!(summary.outcome, StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn test_bad_chunk_is_dropped_and_stream_continues() {
        let scripted = ScriptedModel::new(vec![
            ScriptedStep::Fail("decoder hiccup".into()),
            ScriptedStep::Panic,
            ScriptedStep::Complete("still here".into()),
        ]);
        let (controller, mut handles) = controller_for(scripted.clone());

        let events = stream::iter(vec![
            chunk(&[1, 1]),
            chunk(&[2, 2]),
            StreamEvent::Data(Bytes::from_static(&[9])),
            chunk(&[3, 3]),
            StreamEvent::End,
        ]);
        let summary = controller.run(events).await;

        assert_eq!(drain_fragments(&mut handles), vec!["still here"]);
        assert_eq!(summary.stats.chunks_dropped, 2);
        assert_eq!(summary.stats.chunks_skipped, 1);
        assert_eq!(summary.stats.chunks_processed, 1);
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(scripted.probe().released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_error_releases_once_and_stops_processing() {
        let scripted = ScriptedModel::new(vec![]);
        let (controller, mut handles) = controller_for(scripted.clone());

        let events = stream::iter(vec![
            chunk(&[1, 2, 3]),
            StreamEvent::Error("connection reset".into()),
            chunk(&[4, 5, 6]),
            chunk(&[7, 8, 9]),
            StreamEvent::End,
        ]);
        let summary = controller.run(events).await;

        let probe = scripted.probe();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.released.load(Ordering::SeqCst), 1);
        assert_eq!(summary.stats.chunks_received, 1);
        assert_eq!(summary.final_state, StreamState::Closed);
        assert!(matches!(
            summary.outcome,
            StreamOutcome::Failed(AppError::Transport(_))
        ));
        // Headers were already sent, so the transport just ends the body.
        assert_eq!(handles.start.try_recv().unwrap(), Ok(()));
        assert!(matches!(
            handles.fragments.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_error_before_first_chunk_is_reported_to_transport() {
        let scripted = ScriptedModel::new(vec![]);
        let (controller, mut handles) = controller_for(scripted.clone());

        let summary = controller
            .run(stream::iter(vec![StreamEvent::Error("bad body".into())]))
            .await;

        assert_eq!(
            handles.start.try_recv().unwrap(),
            Err(AppError::Transport("bad body".into()))
        );
        assert_eq!(scripted.probe().created.load(Ordering::SeqCst), 0);
        assert!(matches!(summary.outcome, StreamOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_engine_unavailable_closes_without_processing() {
        let scripted = ScriptedModel::unavailable("model assets missing");
        let (controller, mut handles) = controller_for(scripted.clone());

        let summary = controller
            .run(stream::iter(vec![chunk(&[1, 2]), chunk(&[3, 4])]))
            .await;

        match handles.start.try_recv().unwrap() {
            Err(AppError::EngineUnavailable(msg)) => assert!(msg.contains("model assets missing")),
            other => panic!("unexpected start signal: {:?}", other),
        }
        assert_eq!(summary.final_state, StreamState::Closed);
        assert!(matches!(summary.outcome, StreamOutcome::Rejected(_)));
        assert_eq!(summary.stats.chunks_received, 0);
        assert_eq!(scripted.probe().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_stream_completes_without_session() {
        let scripted = ScriptedModel::new(vec![]);
        let (controller, mut handles) = controller_for(scripted.clone());
        assert_eq!(controller.state(), StreamState::Idle);
        assert_eq!(controller.stream_id(), "test-stream");

        let summary = controller
            .run(stream::iter(vec![StreamEvent::Data(Bytes::new())]))
            .await;

        assert_eq!(handles.start.try_recv().unwrap(), Ok(()));
        assert_eq!(summary.outcome, StreamOutcome::Completed);
        assert_eq!(scripted.probe().created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_stream() {
        let scripted = ScriptedModel::echo(None);
        let (controller, handles) = controller_for(scripted.clone());
        drop(handles);

        let summary = controller
            .run(stream::iter(vec![chunk(&[1]), chunk(&[2]), chunk(&[3])]))
            .await;

        assert_eq!(summary.outcome, StreamOutcome::Cancelled);
        assert_eq!(summary.stats.chunks_received, 1);
        assert_eq!(scripted.probe().released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_streams_are_independent() {
        let model: Arc<dyn SpeechModel> =
            ScriptedModel::echo(Some(Duration::from_millis(2)));
        let provider = ModelProvider::with_model(model);

        let (good, mut good_handles) = StreamController::new("good", provider.clone());
        let (bad, mut bad_handles) = StreamController::new("bad", provider.clone());

        let good_events: Vec<StreamEvent> = (0..20).map(|i| chunk(&[i, 0])).collect();
        let mut bad_events: Vec<StreamEvent> = (100..105).map(|i| chunk(&[i, 0])).collect();
        bad_events.push(StreamEvent::Error("peer vanished".into()));
        bad_events.extend((105..110).map(|i| chunk(&[i, 0])));

        let good_task = tokio::spawn(good.run(stream::iter(good_events)));
        let bad_task = tokio::spawn(bad.run(stream::iter(bad_events)));
        let good_summary = good_task.await.unwrap();
        let bad_summary = bad_task.await.unwrap();

        let expected_good: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let expected_bad: Vec<String> = (100..105).map(|i| i.to_string()).collect();
        assert_eq!(drain_fragments(&mut good_handles), expected_good);
        assert_eq!(drain_fragments(&mut bad_handles), expected_bad);

        assert_eq!(good_summary.outcome, StreamOutcome::Completed);
        assert!(matches!(bad_summary.outcome, StreamOutcome::Failed(_)));
    }
}
