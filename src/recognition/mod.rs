//! # Speech Recognition
//!
//! The recognition engine is consumed through two traits:
//!
//! - [`SpeechModel`]: the loaded model. Loaded once, shared by reference between
//!   all streams, never mutated after loading.
//! - [`Recognizer`]: decoding state for one stream. Created from the model,
//!   exclusively owned by one [`RecognitionSession`], released on drop.
//!
//! ## Backends:
//! - **whisper**: Candle Whisper loaded from the local model directory (default)
//! - **vosk**: Vosk/Kaldi, behind the `vosk` cargo feature

pub mod provider;
pub mod session;
pub mod whisper;

#[cfg(feature = "vosk")]
pub mod vosk;

#[cfg(test)]
pub mod scripted;

pub use provider::ModelProvider;
pub use session::{RecognitionSession, TranscriptFragment};

use anyhow::Result;

/// Output of a recognizer once a decoding unit completed.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RecognitionResult {
    pub text: String,
}

/// A loaded recognition model that can hand out independent recognizers.
pub trait SpeechModel: Send + Sync {
    /// Short engine name for logs and the health endpoint.
    fn engine_name(&self) -> &str;

    /// Create a fresh recognizer bound to `sample_rate`.
    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>>;
}

/// Incremental decoder for one audio stream.
///
/// Calls are strictly sequential and order-dependent. Dropping the recognizer
/// releases its engine resources.
pub trait Recognizer: Send {
    /// Feed samples at the recognizer's sample rate.
    ///
    /// Returns `true` when this call completed a decoding unit; the text is then
    /// available from [`Recognizer::result`].
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<bool>;

    /// Text of the most recently completed decoding unit.
    fn result(&mut self) -> Result<RecognitionResult>;
}
