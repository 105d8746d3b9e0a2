pub mod config;
pub mod stream;

pub use config::*;
pub use stream::*;

use crate::health;
use actix_web::web;

/// All service routes. Middleware is added by the caller.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/speech-to-text-stream", web::post().to(speech_to_text_stream))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(get_config)),
        )
        .route("/health", web::get().to(health::health_check));
}
