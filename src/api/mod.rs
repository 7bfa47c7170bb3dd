pub mod health;
pub mod shared;
pub mod videos;

use std::sync::Arc;

use actix_web::web;

use crate::db::VideoStore;
use crate::queue::JobQueue;

/// Shared handles for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn VideoStore>,
    pub queue: Arc<dyn JobQueue>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .configure(videos::configure)
            .configure(health::configure),
    );
}
