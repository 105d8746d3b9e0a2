//! # Shared Model Provider
//!
//! Loads the recognition model once and hands the same `Arc` to every stream.
//! Loading runs on a blocking thread. If it fails, the stream that asked gets
//! `EngineUnavailable` and the next stream tries again.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::recognition::SpeechModel;
use anyhow::{anyhow, Result};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{error, info};

/// Builds the model. Called at most once successfully.
pub type ModelLoader = Arc<dyn Fn() -> Result<Arc<dyn SpeechModel>> + Send + Sync>;

/// Cheap-to-clone handle to the lazily loaded shared model.
#[derive(Clone)]
pub struct ModelProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    engine: String,
    path: String,
    loader: ModelLoader,
    model: OnceCell<Arc<dyn SpeechModel>>,
    last_error: RwLock<Option<String>>,
}

impl ModelProvider {
    /// Provider for the engine and model directory named in the configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let engine = config.model.engine.clone();
        let loader_config = config.clone();
        let loader: ModelLoader = Arc::new(move || load_engine(&loader_config));
        Self::with_loader(&engine, &config.model.path, loader)
    }

    /// Provider with a custom loader.
    pub fn with_loader(engine: &str, path: &str, loader: ModelLoader) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                engine: engine.to_string(),
                path: path.to_string(),
                loader,
                model: OnceCell::new(),
                last_error: RwLock::new(None),
            }),
        }
    }

    /// Provider around an already loaded model.
    #[cfg(test)]
    pub fn with_model(model: Arc<dyn SpeechModel>) -> Self {
        let engine = model.engine_name().to_string();
        Self {
            inner: Arc::new(ProviderInner {
                engine,
                path: String::new(),
                loader: Arc::new(|| Err(anyhow!("model is preloaded"))),
                model: OnceCell::new_with(Some(model)),
                last_error: RwLock::new(None),
            }),
        }
    }

    /// Get the shared model, loading it first if needed.
    pub async fn get(&self) -> AppResult<Arc<dyn SpeechModel>> {
        let model = self
            .inner
            .model
            .get_or_try_init(|| self.load())
            .await?;
        Ok(Arc::clone(model))
    }

    async fn load(&self) -> AppResult<Arc<dyn SpeechModel>> {
        info!(engine = %self.inner.engine, path = %self.inner.path, "Loading recognition model");
        let started = Instant::now();
        let loader = Arc::clone(&self.inner.loader);

        let outcome = tokio::task::spawn_blocking(move || loader())
            .await
            .map_err(|e| anyhow!("model loader task failed: {}", e))
            .and_then(|result| result);

        match outcome {
            Ok(model) => {
                info!(
                    engine = %self.inner.engine,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Recognition model loaded"
                );
                *self.inner.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
                Ok(model)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(engine = %self.inner.engine, error = %message, "Failed to load recognition model");
                *self.inner.last_error.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(message.clone());
                Err(AppError::EngineUnavailable(message))
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.model.initialized()
    }

    pub fn engine(&self) -> &str {
        &self.inner.engine
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Error message of the most recent failed load, if any.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("engine", &self.inner.engine)
            .field("path", &self.inner.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Instantiate the configured engine. Blocking.
fn load_engine(config: &AppConfig) -> Result<Arc<dyn SpeechModel>> {
    match config.model.engine.as_str() {
        "whisper" => {
            let model = crate::recognition::whisper::WhisperModel::load(
                &config.model.path,
                &config.model.device,
                config.recognizer.clone(),
            )?;
            Ok(Arc::new(model))
        }
        #[cfg(feature = "vosk")]
        "vosk" => {
            let model = crate::recognition::vosk::VoskModel::load(&config.model.path)?;
            Ok(Arc::new(model))
        }
        other => Err(anyhow!(
            "recognition engine '{}' is not available in this build",
            other
        )),
    }
}
