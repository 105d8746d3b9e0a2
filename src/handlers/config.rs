use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration. Read-only: the model and listener cannot change live.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "model": {
                "path": config.model.path,
                "engine": config.model.engine,
                "device": config.model.device,
                "preload": config.model.preload
            },
            "recognizer": {
                "language": config.recognizer.language,
                "min_segment_ms": config.recognizer.min_segment_ms,
                "max_segment_ms": config.recognizer.max_segment_ms,
                "trailing_silence_ms": config.recognizer.trailing_silence_ms,
                "silence_threshold": config.recognizer.silence_threshold
            },
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions
            },
            "audio": {
                "input_sample_rate": crate::audio::INPUT_SAMPLE_RATE,
                "recognizer_sample_rate": crate::audio::RECOGNIZER_SAMPLE_RATE,
                "channels": 1,
                "bit_depth": 16
            }
        }
    })))
}
