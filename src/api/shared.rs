use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct APIError {
    pub cause: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseType<T = String> {
    pub data: Option<T>,
    pub error: Option<APIError>,
}

pub fn ok<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(ResponseType {
        data: Some(data),
        error: None,
    })
}

pub fn error_response(status: StatusCode, cause: &str, message: impl Into<String>) -> HttpResponse {
    HttpResponse::build(status).json(ResponseType::<String> {
        data: None,
        error: Some(APIError {
            cause: cause.to_string(),
            message: message.into(),
        }),
    })
}

pub fn internal_error(err: impl std::fmt::Display) -> HttpResponse {
    log::error!("request failed: {}", err);
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "internal server error",
    )
}
