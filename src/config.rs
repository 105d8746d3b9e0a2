//! # Configuration Management
//!
//! Loads configuration from, in increasing priority:
//! 1. Default values (the `Default` impl below)
//! 2. `config.toml` in the working directory, if present
//! 3. Environment variables with the `APP_` prefix, nested keys joined by `__`
//!    (`APP_SERVER__PORT=7000`, `APP_RECOGNIZER__LANGUAGE=de`)
//! 4. The deployment shortcuts `HOST`, `PORT` and `MODEL_PATH`
//!
//! ## Model directory:
//! The model path must point at an existing directory when the process starts,
//! otherwise `validate` fails and the server refuses to start.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Port used when neither `PORT` nor the config file sets one.
pub const DEFAULT_PORT: u16 = 6010;

/// Engines that can be named in `model.engine`.
pub const KNOWN_ENGINES: &[&str] = &["whisper", "vosk"];

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub recognizer: RecognizerConfig,
    pub performance: PerformanceConfig,
}

/// Where the HTTP server listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which recognition model to load and where from.
///
/// ## Fields:
/// - `path`: Directory holding the model files
/// - `engine`: `"whisper"` (Candle, built in) or `"vosk"` (needs the `vosk` feature)
/// - `device`: Compute device for Candle: `auto`, `cpu`, `cuda` or `metal`
/// - `preload`: Load the model at startup instead of on the first stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub path: String,
    pub engine: String,
    pub device: String,
    pub preload: bool,
}

/// Decoding-unit settings for engines that endpoint on their own (Whisper).
///
/// A decoding unit completes once at least `min_segment_ms` of audio is buffered
/// and the last `trailing_silence_ms` stayed under `silence_threshold` (RMS on the
/// [-1, 1] float scale), or as soon as `max_segment_ms` is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecognizerConfig {
    pub language: String,
    pub min_segment_ms: u32,
    pub max_segment_ms: u32,
    pub trailing_silence_ms: u32,
    pub silence_threshold: f32,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
            },
            model: ModelConfig {
                path: "model".to_string(),
                engine: "whisper".to_string(),
                device: "auto".to_string(),
                preload: true,
            },
            recognizer: RecognizerConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            min_segment_ms: 1_000,
            max_segment_ms: 10_000,   // well under Whisper's 30 s window
            trailing_silence_ms: 600,
            silence_threshold: 0.01,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(model_path) = env::var("MODEL_PATH") {
            settings = settings.set_override("model.path", model_path)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the configuration, including that the model directory exists.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if !KNOWN_ENGINES.contains(&self.model.engine.as_str()) {
            return Err(anyhow!(
                "Unknown recognition engine '{}' (expected one of: {})",
                self.model.engine,
                KNOWN_ENGINES.join(", ")
            ));
        }

        let rec = &self.recognizer;
        if rec.min_segment_ms == 0 || rec.min_segment_ms > rec.max_segment_ms {
            return Err(anyhow!(
                "Recognizer segment bounds are inconsistent: min {}ms, max {}ms",
                rec.min_segment_ms,
                rec.max_segment_ms
            ));
        }

        if rec.max_segment_ms > 30_000 {
            return Err(anyhow!("Recognizer max_segment_ms cannot exceed 30000"));
        }

        if !(0.0..1.0).contains(&rec.silence_threshold) {
            return Err(anyhow!("Silence threshold must be in [0, 1)"));
        }

        if !Path::new(&self.model.path).is_dir() {
            return Err(anyhow!(
                "Model directory '{}' not found. Download a model (Whisper: config.json, \
                 tokenizer.json and model.safetensors; Vosk: https://alphacephei.com/vosk/models) \
                 and unpack it as '{}', or point MODEL_PATH at it.",
                self.model.path,
                self.model.path
            ));
        }

        Ok(())
    }

    /// Socket address string for `HttpServer::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
