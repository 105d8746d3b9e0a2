//! # Recognition Session
//!
//! Owns exactly one recognizer for the lifetime of one inbound stream.
//!
//! ## Session Lifecycle:
//! 1. **open**: create a recognizer bound to 16 kHz on the shared model
//! 2. **push_samples**: feed upsampled chunks, surface completed fragments
//! 3. **close**: release the recognizer (idempotent, also run on drop)

use crate::audio::pcm::bytes_to_samples;
use crate::audio::RECOGNIZER_SAMPLE_RATE;
use crate::error::{AppError, AppResult};
use crate::recognition::{Recognizer, SpeechModel};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// One piece of recognized text, delivered to the client in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment(String);

impl TranscriptFragment {
    /// Wrap recognizer output as is. Returns `None` only for an empty string;
    /// leading and inner whitespace belong to the transcript.
    pub fn new(text: &str) -> Option<Self> {
        if text.is_empty() {
            None
        } else {
            Some(Self(text.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TranscriptFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive wrapper around one recognizer.
pub struct RecognitionSession {
    stream_id: String,
    engine: String,
    recognizer: Option<Box<dyn Recognizer>>,
    chunks_accepted: u64,
    fragments_emitted: u64,
}

impl RecognitionSession {
    /// Acquire a recognizer from the shared model.
    ///
    /// ## Errors:
    /// `AppError::EngineUnavailable` if the engine refuses to create a recognizer.
    pub fn open(model: &Arc<dyn SpeechModel>, stream_id: &str) -> AppResult<Self> {
        let recognizer = model
            .create_recognizer(RECOGNIZER_SAMPLE_RATE)
            .map_err(|e| AppError::EngineUnavailable(format!("{:#}", e)))?;

        info!(
            stream_id,
            engine = model.engine_name(),
            sample_rate = RECOGNIZER_SAMPLE_RATE,
            "Recognition session opened"
        );

        Ok(Self {
            stream_id: stream_id.to_string(),
            engine: model.engine_name().to_string(),
            recognizer: Some(recognizer),
            chunks_accepted: 0,
            fragments_emitted: 0,
        })
    }

    /// Feed one 16 kHz PCM chunk.
    ///
    /// Returns `Ok(None)` when the engine did not complete a decoding unit on this
    /// call, which is the common case. A completed unit with empty text also
    /// yields `Ok(None)`.
    pub fn push_samples(&mut self, pcm: &[u8]) -> AppResult<Option<TranscriptFragment>> {
        let recognizer = self.recognizer.as_mut().ok_or_else(|| {
            AppError::ChunkProcessing("recognition session is already closed".to_string())
        })?;

        let samples = bytes_to_samples(pcm);
        let completed = recognizer
            .accept_waveform(&samples)
            .map_err(|e| AppError::ChunkProcessing(format!("accept_waveform failed: {:#}", e)))?;
        self.chunks_accepted += 1;

        if !completed {
            return Ok(None);
        }

        let result = recognizer
            .result()
            .map_err(|e| AppError::ChunkProcessing(format!("result failed: {:#}", e)))?;
        debug!(stream_id = %self.stream_id, text = %result.text, "Decoding unit completed");

        let fragment = TranscriptFragment::new(&result.text);
        if fragment.is_some() {
            self.fragments_emitted += 1;
        }
        Ok(fragment)
    }

    /// Release the recognizer. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(recognizer) = self.recognizer.take() {
            drop(recognizer);
            info!(
                stream_id = %self.stream_id,
                engine = %self.engine,
                chunks = self.chunks_accepted,
                fragments = self.fragments_emitted,
                "Recognition session closed"
            );
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.recognizer.is_some()
    }

    #[cfg(test)]
    pub fn chunks_accepted(&self) -> u64 {
        self.chunks_accepted
    }

    #[cfg(test)]
    pub fn fragments_emitted(&self) -> u64 {
        self.fragments_emitted
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.close();
    }
}
