//! # Vosk Recognition Backend
//!
//! Kaldi-based recognizer through the `vosk` bindings. The model directory is a
//! Vosk model as distributed on https://alphacephei.com/vosk/models.
//! Vosk endpoints on its own, so `accept_waveform` maps straight onto
//! `Recognizer::accept_waveform`.

use crate::recognition::{RecognitionResult, Recognizer, SpeechModel};
use anyhow::{anyhow, Result};
use tracing::info;
use vosk::DecodingState;

/// Loaded Vosk model. Thread-safe in the bindings, shared between streams.
pub struct VoskModel {
    model: vosk::Model,
}

impl VoskModel {
    /// Load the model from `model_dir`. Blocking.
    pub fn load(model_dir: &str) -> Result<Self> {
        let model = vosk::Model::new(model_dir)
            .ok_or_else(|| anyhow!("Vosk could not load a model from {}", model_dir))?;
        info!(model_dir, "Vosk model loaded");
        Ok(Self { model })
    }
}

impl SpeechModel for VoskModel {
    fn engine_name(&self) -> &str {
        "vosk"
    }

    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>> {
        let recognizer = vosk::Recognizer::new(&self.model, sample_rate as f32)
            .ok_or_else(|| anyhow!("Vosk could not create a recognizer at {} Hz", sample_rate))?;
        Ok(Box::new(VoskRecognizer { recognizer }))
    }
}

struct VoskRecognizer {
    recognizer: vosk::Recognizer,
}

impl Recognizer for VoskRecognizer {
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<bool> {
        let state = self
            .recognizer
            .accept_waveform(samples)
            .map_err(|e| anyhow!("Vosk rejected the waveform: {:?}", e))?;
        unit_completed(state)
    }

    fn result(&mut self) -> Result<RecognitionResult> {
        let text = self
            .recognizer
            .result()
            .single()
            .map(|single| single.text.to_string())
            .unwrap_or_default();
        Ok(RecognitionResult { text })
    }
}

/// `true` once Vosk has endpointed an utterance and a result is ready.
fn unit_completed(state: DecodingState) -> Result<bool> {
    match state {
        DecodingState::Finalized => Ok(true),
        DecodingState::Running => Ok(false),
        DecodingState::Failed => Err(anyhow!("Vosk failed to decode the waveform")),
    }
}
