use axum::{Json, response::Json as ResponseJson};
use utils::response::ApiResponse;

pub async fn health_check() -> ResponseJson<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}
