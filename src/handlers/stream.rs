//! # Streaming Speech-to-Text Endpoint
//!
//! `POST /speech-to-text-stream` takes a chunked body of raw 8 kHz mono s16le PCM
//! and answers with a streaming body of recognized text as it becomes available.
//!
//! ## Request Flow:
//! 1. Reserve a stream slot (`503` when the concurrency limit is reached)
//! 2. Spawn a [`StreamController`] on the local task set; it owns the payload
//! 3. Wait for the controller to decide how the response starts:
//!    - session opened (or the body was empty): `200` with a streaming body
//!    - engine unavailable: `503`
//!    - body failed before any audio arrived: `500`
//! 4. Fragments are written to the body in the order they were produced; the
//!    body ends when the controller closes
//!
//! The body is plain concatenated text without SSE framing, even though the
//! content type is `text/event-stream`. Existing clients read it that way.

use crate::error::{AppError, AppResult};
use crate::recognition::TranscriptFragment;
use crate::state::AppState;
use crate::stream::{StreamController, StreamEvent};
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn speech_to_text_stream(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let guard = state.try_acquire_stream().map_err(|e| {
        warn!(error = %e, "Rejecting audio stream");
        e
    })?;

    let stream_id = Uuid::new_v4().to_string();
    let peer = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(stream_id = %stream_id, peer = %peer, "Audio stream opened");

    let (controller, handles) = StreamController::new(stream_id.clone(), state.model_provider());

    // The payload is tied to this worker's thread, so the controller runs locally.
    let app_state = state.clone();
    actix_web::rt::spawn(async move {
        let summary = controller.run(payload_events(payload)).await;
        app_state.record_stream(&summary);
        drop(guard);
    });

    match handles.start.await {
        Ok(Ok(())) => Ok(HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header((header::CONNECTION, "keep-alive"))
            .streaming(fragment_body(handles.fragments))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AppError::Internal(format!(
            "stream {} stopped before it could respond",
            stream_id
        ))),
    }
}

/// Map the request body onto controller events. The end of the body is
/// reported by the stream ending.
fn payload_events(payload: web::Payload) -> impl Stream<Item = StreamEvent> + Unpin {
    payload.map(|item| match item {
        Ok(chunk) => StreamEvent::Data(chunk),
        Err(e) => StreamEvent::Error(e.to_string()),
    })
}

fn fragment_body(
    fragments: mpsc::UnboundedReceiver<TranscriptFragment>,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    UnboundedReceiverStream::new(fragments)
        .map(|fragment| Ok::<_, actix_web::Error>(Bytes::from(fragment.into_string())))
}
