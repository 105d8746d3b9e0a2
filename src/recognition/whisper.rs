//! # Whisper Recognition Backend
//!
//! Runs Whisper through Candle on a model stored in a local directory.
//!
//! ## Model Directory Layout:
//! - `config.json`: Whisper model configuration (HuggingFace format)
//! - `tokenizer.json`: Tokenizer definition
//! - `model.safetensors`: Model weights
//! - `melfilters.bytes` (optional): Precomputed mel filter bank as little-endian f32;
//!   computed on load when absent
//!
//! ## Decoding Units:
//! Whisper is not incremental, so each recognizer buffers audio in a [`Segmenter`]
//! and only runs the model when a unit completes: enough audio followed by a
//! quiet tail, or the maximum unit length. Pure silence is never decoded.

use crate::audio::pcm::{rms, samples_to_f32};
use crate::audio::RECOGNIZER_SAMPLE_RATE;
use crate::config::RecognizerConfig;
use crate::device::{create_device_from_string, DeviceManager};
use crate::recognition::{RecognitionResult, Recognizer, SpeechModel};
use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const MEL_FILTERS_FILE: &str = "melfilters.bytes";

/// Token ids the decoder loop needs.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    language: Option<u32>,
}

/// Loaded Whisper weights, tokenizer and mel filters.
///
/// Shared read-only between streams. Recognizers get a clone of `model`: the
/// weight tensors are reference counted, only the attention caches are per stream.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Arc<Tokenizer>,
    mel_filters: Arc<Vec<f32>>,
    tokens: SpecialTokens,
    device: Device,
    segmenting: RecognizerConfig,
    name: String,
}

impl WhisperModel {
    /// Load a Whisper model from `model_dir`. Blocking.
    ///
    /// ## Loading Process:
    /// 1. Check the directory holds config, tokenizer and weights
    /// 2. Select the compute device
    /// 3. Memory-map the weights and build the model instance recognizers clone
    /// 4. Resolve special tokens and the mel filter bank
    pub fn load(model_dir: &str, device: &str, segmenting: RecognizerConfig) -> Result<Self> {
        let started = Instant::now();
        let dir = Path::new(model_dir);
        let config_file = required_file(dir, "config.json")?;
        let tokenizer_file = required_file(dir, "tokenizer.json")?;
        let weights_file = required_file(dir, "model.safetensors")?;

        let device = create_device_from_string(device);
        info!(
            model_dir,
            device = %DeviceManager::get_device_info(&device),
            "Loading Whisper model"
        );

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&config_file)
                .with_context(|| format!("opening {}", config_file.display()))?,
        )
        .with_context(|| format!("parsing {}", config_file.display()))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        // SAFETY: the weights file is not modified while the server runs.
        let weights =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&weights, config.clone())
            .context("model weights do not match config.json")?;

        let tokens = SpecialTokens {
            sot: token_id(&tokenizer, m::SOT_TOKEN)?,
            eot: token_id(&tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
            language: language_token(&tokenizer, &segmenting.language),
        };

        let mel_filters = load_mel_filters(dir, config.num_mel_bins)?;

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_dir.to_string());

        info!(
            model = %name,
            mel_bins = config.num_mel_bins,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Whisper model loaded"
        );

        Ok(Self {
            model,
            config,
            tokenizer: Arc::new(tokenizer),
            mel_filters: Arc::new(mel_filters),
            tokens,
            device,
            segmenting,
            name,
        })
    }
}

impl SpeechModel for WhisperModel {
    fn engine_name(&self) -> &str {
        "whisper"
    }

    fn create_recognizer(&self, sample_rate: u32) -> Result<Box<dyn Recognizer>> {
        if sample_rate != m::SAMPLE_RATE as u32 {
            return Err(anyhow!(
                "Whisper requires {} Hz audio, recognizer requested at {} Hz",
                m::SAMPLE_RATE,
                sample_rate
            ));
        }

        debug!(model = %self.name, "Whisper recognizer created");
        Ok(Box::new(WhisperRecognizer {
            model: self.model.clone(),
            config: self.config.clone(),
            tokenizer: Arc::clone(&self.tokenizer),
            mel_filters: Arc::clone(&self.mel_filters),
            tokens: self.tokens,
            device: self.device.clone(),
            segmenter: Segmenter::new(&self.segmenting, sample_rate),
            last_text: String::new(),
        }))
    }
}

/// Decoder state for one stream.
struct WhisperRecognizer {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Arc<Tokenizer>,
    mel_filters: Arc<Vec<f32>>,
    tokens: SpecialTokens,
    device: Device,
    segmenter: Segmenter,
    last_text: String,
}

impl Recognizer for WhisperRecognizer {
    fn accept_waveform(&mut self, samples: &[i16]) -> Result<bool> {
        let pcm = samples_to_f32(samples);
        match self.segmenter.push(&pcm) {
            Some(unit) => {
                self.last_text = self.transcribe(&unit)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn result(&mut self) -> Result<RecognitionResult> {
        Ok(RecognitionResult {
            text: std::mem::take(&mut self.last_text),
        })
    }
}

impl WhisperRecognizer {
    /// Greedy decoding of one unit of 16 kHz float audio.
    fn transcribe(&mut self, pcm: &[f32]) -> Result<String> {
        let started = Instant::now();

        let mel = audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        // pcm_to_mel pads with zeros; the encoder takes at most one 30 s window.
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?
            .narrow(2, 0, frames.min(m::N_FRAMES))?;
        let audio_features = self.model.encoder.forward(&mel, true)?;

        let mut tokens = vec![self.tokens.sot];
        if let Some(language) = self.tokens.language {
            tokens.push(language);
        }
        tokens.push(self.tokens.transcribe);
        tokens.push(self.tokens.no_timestamps);
        let prompt_len = tokens.len();

        let max_tokens = self.config.max_target_positions / 2;
        for i in 0..max_tokens {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let next_token = logits.argmax(0)?.to_scalar::<u32>()?;

            if next_token == self.tokens.eot {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next_token) {
                warn!("Whisper decoder started repeating, cutting the unit short");
                break;
            }
            tokens.push(next_token);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        debug!(
            audio_secs = pcm.len() as f64 / RECOGNIZER_SAMPLE_RATE as f64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            text = %text,
            "Whisper unit decoded"
        );

        Ok(text)
    }
}

/// Energy-based endpointing that groups incoming audio into decoding units.
#[derive(Debug)]
pub struct Segmenter {
    min_samples: usize,
    max_samples: usize,
    trailing_samples: usize,
    threshold: f32,
    buffer: Vec<f32>,
    speech_seen: bool,
}

impl Segmenter {
    pub fn new(config: &RecognizerConfig, sample_rate: u32) -> Self {
        let per_ms = |ms: u32| (ms as u64 * sample_rate as u64 / 1000) as usize;
        Self {
            min_samples: per_ms(config.min_segment_ms),
            max_samples: per_ms(config.max_segment_ms),
            trailing_samples: per_ms(config.trailing_silence_ms),
            threshold: config.silence_threshold,
            buffer: Vec::new(),
            speech_seen: false,
        }
    }

    /// Append audio; returns the buffered unit when it is complete.
    ///
    /// Until a chunk above the silence threshold arrives, only the last
    /// `trailing_silence_ms` of audio is kept as pre-roll.
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        if samples.is_empty() {
            return None;
        }
        if rms(samples) >= self.threshold {
            self.speech_seen = true;
        }
        self.buffer.extend_from_slice(samples);

        if !self.speech_seen {
            if self.buffer.len() > self.trailing_samples {
                let excess = self.buffer.len() - self.trailing_samples;
                self.buffer.drain(..excess);
            }
            return None;
        }

        let len = self.buffer.len();
        let reached_max = len >= self.max_samples;
        let quiet_tail = len >= self.min_samples
            && len >= self.trailing_samples
            && rms(&self.buffer[len - self.trailing_samples..]) < self.threshold;

        if reached_max || quiet_tail {
            self.speech_seen = false;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }
}

fn required_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(anyhow!(
            "Model directory {} does not contain {}",
            dir.display(),
            name
        ))
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no {} token", token))
}

fn language_token(tokenizer: &Tokenizer, language: &str) -> Option<u32> {
    if language.is_empty() {
        return None;
    }
    let token = format!("<|{}|>", language.to_lowercase());
    let id = tokenizer.token_to_id(&token);
    if id.is_none() {
        warn!(language, "Unknown Whisper language, decoding without a language token");
    }
    id
}

/// Stop when the last three tokens repeat or the same token comes three times.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    let len = tokens.len();
    if len >= 3 && tokens[len - 3..].iter().all(|&t| t == new_token) {
        return true;
    }
    if len >= 5 {
        let mut last_3 = tokens[len - 2..].to_vec();
        last_3.push(new_token);
        if last_3 == tokens[len - 5..len - 2] {
            return true;
        }
    }
    false
}

/// Read `melfilters.bytes` when present, otherwise compute the filter bank.
fn load_mel_filters(dir: &Path, n_mels: usize) -> Result<Vec<f32>> {
    let n_freqs = m::N_FFT / 2 + 1;
    let path = dir.join(MEL_FILTERS_FILE);
    if path.is_file() {
        let bytes = std::fs::read(&path)?;
        if bytes.len() != n_mels * n_freqs * 4 {
            return Err(anyhow!(
                "{} has {} bytes, expected {} for {} mel bins",
                path.display(),
                bytes.len(),
                n_mels * n_freqs * 4,
                n_mels
            ));
        }
        let mut filters = vec![0f32; n_mels * n_freqs];
        LittleEndian::read_f32_into(&bytes, &mut filters);
        return Ok(filters);
    }
    Ok(mel_filter_bank(n_mels, m::N_FFT, RECOGNIZER_SAMPLE_RATE))
}

/// Slaney-style mel filter bank with area normalization, laid out
/// `[n_mels][n_fft / 2 + 1]`.
pub fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: u32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * nyquist / (n_freqs - 1) as f64)
        .collect();

    let mel_max = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for mel in 0..n_mels {
        let (lower, center, upper) = (mel_points[mel], mel_points[mel + 1], mel_points[mel + 2]);
        let enorm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[mel * n_freqs + k] = (weight * enorm) as f32;
        }
    }
    filters
}

const MEL_F_SP: f64 = 200.0 / 3.0;
const MEL_MIN_LOG_HZ: f64 = 1000.0;
const MEL_MIN_LOG_MEL: f64 = MEL_MIN_LOG_HZ / MEL_F_SP;

fn mel_log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MEL_MIN_LOG_HZ {
        hz / MEL_F_SP
    } else {
        MEL_MIN_LOG_MEL + (hz / MEL_MIN_LOG_HZ).ln() / mel_log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MEL_MIN_LOG_MEL {
        mel * MEL_F_SP
    } else {
        MEL_MIN_LOG_HZ * (mel_log_step() * (mel - MEL_MIN_LOG_MEL)).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> Segmenter {
        Segmenter::new(
            &RecognizerConfig {
                language: "en".into(),
                min_segment_ms: 100,
                max_segment_ms: 500,
                trailing_silence_ms: 50,
                silence_threshold: 0.01,
            },
            16_000,
        )
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect()
    }

    #[test]
    fn test_silence_is_never_a_unit() {
        let mut seg = segmenter();
        for _ in 0..100 {
            assert!(seg.push(&vec![0.0; 320]).is_none());
        }
        // Only the pre-roll is kept
        assert_eq!(seg.buffered_samples(), 800);
    }

    #[test]
    fn test_speech_then_quiet_tail_completes_unit() {
        let mut seg = segmenter();
        assert!(seg.push(&tone(1600)).is_none());
        assert!(seg.push(&tone(320)).is_none());
        let unit = seg.push(&vec![0.0; 800]).expect("quiet tail should close the unit");
        assert_eq!(unit.len(), 2720);
        assert_eq!(seg.buffered_samples(), 0);
    }

    #[test]
    fn test_long_speech_is_cut_at_max() {
        let mut seg = segmenter();
        let mut units = 0;
        for _ in 0..10 {
            if let Some(unit) = seg.push(&tone(1600)) {
                assert_eq!(unit.len(), 8000);
                units += 1;
            }
        }
        assert_eq!(units, 2);
    }

    #[test]
    fn test_repetition_detection() {
        assert!(!is_repetitive(&[1, 2], 2));
        assert!(is_repetitive(&[5, 7, 7, 7], 7));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3));
        assert!(is_repetitive(&[9, 1, 2, 3, 1, 2], 3));
        assert!(!is_repetitive(&[9, 1, 2, 3, 1, 2], 4));
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80, 400, 16_000);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|&w| w >= 0.0));
        for mel in 0..80 {
            let row = &filters[mel * 201..(mel + 1) * 201];
            assert!(row.iter().any(|&w| w > 0.0), "mel bin {} is empty", mel);
        }
    }

    #[test]
    fn test_mel_scale_round_trip_points() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((mel_to_hz(hz_to_mel(4000.0)) - 4000.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_reports_missing_files() {
        let dir = std::env::temp_dir().join(format!("whisper-missing-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let err = WhisperModel::load(dir.to_str().unwrap(), "cpu", RecognizerConfig::default())
            .err()
            .expect("empty directory cannot load");
        assert!(err.to_string().contains("config.json"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    /// Writes a randomly initialised two-layer Whisper with a word-level tokenizer.
    fn tiny_model_dir() -> PathBuf {
        use candle_nn::VarMap;
        use std::collections::HashMap;
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::AddedToken;

        let dir = std::env::temp_dir().join(format!("whisper-tiny-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let specials = [
            m::EOT_TOKEN,
            m::SOT_TOKEN,
            m::TRANSCRIBE_TOKEN,
            m::NO_TIMESTAMPS_TOKEN,
        ];
        let words = ["<unk>", "hello", "world"];
        let vocab: HashMap<String, u32> = specials
            .iter()
            .chain(words.iter())
            .enumerate()
            .map(|(id, token)| (token.to_string(), id as u32))
            .collect();
        let vocab_size = vocab.len();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        let added: Vec<AddedToken> = specials.iter().map(|t| AddedToken::from(*t, true)).collect();
        tokenizer.add_special_tokens(&added);
        tokenizer.save(dir.join("tokenizer.json"), false).unwrap();

        let config = serde_json::json!({
            "num_mel_bins": 8,
            "max_source_positions": 1500,
            "d_model": 8,
            "encoder_attention_heads": 2,
            "encoder_layers": 1,
            "vocab_size": vocab_size,
            "max_target_positions": 16,
            "decoder_attention_heads": 2,
            "decoder_layers": 1
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
        let config: Config = serde_json::from_value(config).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, m::DTYPE, &Device::Cpu);
        m::model::Whisper::load(&vb, config).unwrap();
        varmap.save(dir.join("model.safetensors")).unwrap();
        dir
    }

    fn decode_one_unit(recognizer: &mut Box<dyn Recognizer>) -> String {
        let chunk: Vec<i16> = (0..1600)
            .map(|i| if i % 2 == 0 { 10_000 } else { -10_000 })
            .collect();
        for _ in 0..10 {
            if recognizer.accept_waveform(&chunk).unwrap() {
                return recognizer.result().unwrap().text;
            }
        }
        panic!("no decoding unit completed");
    }

    #[test]
    fn test_recognizers_share_loaded_weights_and_decode_independently() {
        let dir = tiny_model_dir();
        let segmenting = RecognizerConfig {
            language: String::new(),
            min_segment_ms: 100,
            max_segment_ms: 500,
            trailing_silence_ms: 50,
            silence_threshold: 0.01,
        };
        let model = WhisperModel::load(dir.to_str().unwrap(), "cpu", segmenting).unwrap();
        assert_eq!(model.engine_name(), "whisper");
        assert!(model.create_recognizer(8_000).is_err());

        let mut first = model.create_recognizer(16_000).unwrap();
        let mut second = model.create_recognizer(16_000).unwrap();

        let text = decode_one_unit(&mut first);
        // The decoder cache is flushed per unit, so the same audio decodes the same way.
        assert_eq!(decode_one_unit(&mut first), text);
        assert_eq!(decode_one_unit(&mut second), text);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
