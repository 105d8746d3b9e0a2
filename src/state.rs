//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## Contents:
//! - **config**: the validated configuration, fixed for the life of the process
//! - **models**: the lazily loaded speech model shared by all streams
//! - **metrics**: request and stream counters behind an `Arc<RwLock<_>>`
//! - **start_time**: for uptime reporting
//!
//! ## Stream admission:
//! `try_acquire_stream` enforces `performance.max_concurrent_sessions` and returns
//! a [`StreamGuard`]. The guard lives as long as the stream's controller task and
//! gives the slot back when dropped, whatever way the stream ended.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::recognition::ModelProvider;
use crate::stream::{StreamOutcome, StreamSummary};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Read-only after startup
    pub config: Arc<AppConfig>,

    /// Shared recognition model, loaded on first use (or at startup with `model.preload`)
    pub models: ModelProvider,

    /// Updated by the middleware on every request and by each finished stream
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,
}

/// Counters collected across all requests and streams.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Streams currently holding a recognition slot
    pub active_sessions: usize,

    pub streams_started: u64,
    pub streams_completed: u64,
    pub streams_failed: u64,
    pub streams_rejected: u64,
    pub streams_cancelled: u64,

    pub chunks_processed: u64,
    pub chunks_dropped: u64,
    pub fragments_sent: u64,
    pub audio_bytes_received: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let models = ModelProvider::from_config(&config);
        Self::with_models(config, models)
    }

    /// State around an existing model provider.
    pub fn with_models(config: AppConfig, models: ModelProvider) -> Self {
        Self {
            config: Arc::new(config),
            models,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn model_provider(&self) -> ModelProvider {
        self.models.clone()
    }

    // A panicking handler must not take the counters down with it.
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a stream slot.
    ///
    /// ## Errors:
    /// `AppError::TooManyStreams` when `max_concurrent_sessions` streams are active.
    pub fn try_acquire_stream(&self) -> AppResult<StreamGuard> {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions >= limit {
            metrics.streams_rejected += 1;
            return Err(AppError::TooManyStreams(format!(
                "{} streams already active (limit {})",
                metrics.active_sessions, limit
            )));
        }
        metrics.active_sessions += 1;
        metrics.streams_started += 1;

        Ok(StreamGuard {
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// Fold a finished stream's counters into the totals.
    pub fn record_stream(&self, summary: &StreamSummary) {
        let mut metrics = self.write_metrics();
        match summary.outcome {
            StreamOutcome::Completed => metrics.streams_completed += 1,
            StreamOutcome::Rejected(_) => metrics.streams_rejected += 1,
            StreamOutcome::Failed(_) => metrics.streams_failed += 1,
            StreamOutcome::Cancelled => metrics.streams_cancelled += 1,
        }
        metrics.chunks_processed += summary.stats.chunks_processed;
        metrics.chunks_dropped += summary.stats.chunks_dropped;
        metrics.fragments_sent += summary.stats.fragments_sent;
        metrics.audio_bytes_received += summary.stats.bytes_in;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Holds one stream slot; releases it on drop.
#[derive(Debug)]
pub struct StreamGuard {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Errors per request, 0.0 to 1.0
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
