//! Test doubles for the recognition engine.

use crate::recognition::{RecognitionResult, Recognizer, SpeechModel};
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted recognizer does on one `accept_waveform` call.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// No decoding unit completed
    Pending,
    /// A decoding unit completed with this text
    Complete(String),
    /// The engine reports an error
    Fail(String),
    /// The engine panics
    Panic,
}

/// Counters shared by a scripted model and all recognizers it created.
#[derive(Debug, Default)]
pub struct Probe {
    pub created: AtomicUsize,
    pub released: AtomicUsize,
    pub calls: AtomicUsize,
    pub samples_seen: AtomicUsize,
}

/// Model whose recognizers replay a fixed script.
///
/// Every recognizer gets its own copy of the script; once it is exhausted the
/// recognizer keeps answering `Pending`. In echo mode every call completes a unit
/// whose text is the first sample of the chunk.
pub struct ScriptedModel {
    script: Vec<ScriptedStep>,
    echo: bool,
    delay: Option<Duration>,
    unavailable: Option<String>,
    probe: Arc<Probe>,
}

impl ScriptedModel {
    pub fn new(script: Vec<ScriptedStep>) -> Arc<Self> {
        Arc::new(Self {
            script,
            echo: false,
            delay: None,
            unavailable: None,
            probe: Arc::new(Probe::default()),
        })
    }

    pub fn echo(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            echo: true,
            delay,
            unavailable: None,
            probe: Arc::new(Probe::default()),
        })
    }

    pub fn unavailable(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Vec::new(),
            echo: false,
            delay: None,
            unavailable: Some(reason.to_string()),
            probe: Arc::new(Probe::default()),
        })
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }
}

impl SpeechModel for ScriptedModel {
    fn engine_name(&self) -> &str {
        "scripted"
    }

    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>> {
        if let Some(reason) = &self.unavailable {
            return Err(anyhow!("{}", reason));
        }
        assert_eq!(sample_rate, 16_000);
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedRecognizer {
            steps: self.script.iter().cloned().collect(),
            echo: self.echo,
            delay: self.delay,
            last_text: String::new(),
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct ScriptedRecognizer {
    steps: VecDeque<ScriptedStep>,
    echo: bool,
    delay: Option<Duration>,
    last_text: String,
    probe: Arc<Probe>,
}

impl Recognizer for ScriptedRecognizer {
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<bool> {
        self.probe.calls.fetch_add(1, Ordering::SeqCst);
        self.probe.samples_seen.fetch_add(samples.len(), Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if self.echo {
            self.last_text = samples.first().map(|s| s.to_string()).unwrap_or_default();
            return Ok(true);
        }

        match self.steps.pop_front().unwrap_or(ScriptedStep::Pending) {
            ScriptedStep::Pending => Ok(false),
            ScriptedStep::Complete(text) => {
                self.last_text = text;
                Ok(true)
            }
            ScriptedStep::Fail(reason) => Err(anyhow!("{}", reason)),
            ScriptedStep::Panic => panic!("scripted recognizer panic"),
        }
    }

    fn result(&mut self) -> Result<RecognitionResult> {
        Ok(RecognitionResult {
            text: std::mem::take(&mut self.last_text),
        })
    }
}

impl Drop for ScriptedRecognizer {
    fn drop(&mut self) {
        self.probe.released.fetch_add(1, Ordering::SeqCst);
    }
}
