use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use uuid::Uuid;

use super::shared::{error_response, internal_error, ok};
use super::AppState;
use crate::db::models::VideoWithMeta;
use crate::services::intake::{self, ReprocessOutcome};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/videos")
            .route("/{id}", web::get().to(get_video))
            .route("/{id}/reprocess", web::post().to(reprocess_video)),
    );
}

pub async fn get_video(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    let video_id = path.into_inner();
    let video = match state.store.find(video_id).await {
        Ok(Some(video)) => video,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("video {video_id} not found"),
            )
        }
        Err(err) => return internal_error(err),
    };
    match state.store.renditions(video_id).await {
        Ok(renditions) => ok(VideoWithMeta { video, renditions }),
        Err(err) => internal_error(err),
    }
}

pub async fn reprocess_video(state: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    let video_id = path.into_inner();
    match intake::reprocess(state.store.as_ref(), state.queue.as_ref(), video_id).await {
        Ok(ReprocessOutcome::Requeued) => HttpResponse::Accepted().json(serde_json::json!({
            "data": { "id": video_id, "processing_status": "pending" },
            "error": null
        })),
        Ok(ReprocessOutcome::NotFailed) => error_response(
            StatusCode::CONFLICT,
            "invalid_state",
            "only failed videos with a retained source can be reprocessed",
        ),
        Ok(ReprocessOutcome::NotFound) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("video {video_id} not found"),
        ),
        Err(err) => internal_error(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{test, App};
    use chrono::{Duration, Utc};

    use super::*;
    use crate::db::models::NewVideo;
    use crate::db::{ClaimOutcome, MemoryVideoStore, VideoStore};
    use crate::queue::MemoryJobQueue;

    async fn seeded() -> (Arc<MemoryVideoStore>, Arc<MemoryJobQueue>, Uuid) {
        let store = Arc::new(MemoryVideoStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let id = Uuid::new_v4();
        store
            .insert(NewVideo::pending(
                id,
                "launch-day".into(),
                "Launch day".into(),
                None,
                Uuid::new_v4(),
                "tmp/launch.mp4".into(),
                Utc::now().naive_utc(),
            ))
            .await
            .unwrap();
        (store, queue, id)
    }

    fn state(store: Arc<MemoryVideoStore>, queue: Arc<MemoryJobQueue>) -> web::Data<AppState> {
        web::Data::new(AppState { store, queue })
    }

    #[actix_web::test]
    async fn shows_processing_state() {
        let (store, queue, id) = seeded().await;
        let app = test::init_service(
            App::new()
                .app_data(state(store, queue))
                .configure(configure),
        )
        .await;
        let req = test::TestRequest::get()
            .uri(&format!("/videos/{id}"))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["processing_status"], "pending");
        assert_eq!(body["data"]["status"], "processing");
        assert!(body["data"]["renditions"].as_array().unwrap().is_empty());
        assert!(body["data"].get("claim_token").is_none());
    }

    #[actix_web::test]
    async fn unknown_video_is_404() {
        let (store, queue, _) = seeded().await;
        let app = test::init_service(
            App::new()
                .app_data(state(store, queue))
                .configure(configure),
        )
        .await;
        let req = test::TestRequest::get()
            .uri(&format!("/videos/{}", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn reprocess_requires_failed_video() {
        let (store, queue, id) = seeded().await;
        let app = test::init_service(
            App::new()
                .app_data(state(store.clone(), queue.clone()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri(&format!("/videos/{id}/reprocess"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let token = Uuid::new_v4();
        let stale_before = Utc::now().naive_utc() - Duration::minutes(30);
        assert!(matches!(
            store.claim(id, token, stale_before).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        store.fail(id, token, "corrupt source", 1).await.unwrap();

        let req = test::TestRequest::post()
            .uri(&format!("/videos/{id}/reprocess"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);
        assert_eq!(queue.ready_len().await, 1);
        let video = store.find(id).await.unwrap().unwrap();
        assert_eq!(video.processing_status, "pending");
    }
}
