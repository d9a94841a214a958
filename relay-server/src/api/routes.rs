use super::handlers::{self, AppState};
use super::sse;
use super::upload::{self, MODEL_UPLOAD_LIMIT};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // 模型管理
        .route(
            "/api/custom-network/list",
            get(handlers::list_models)
                .post(upload::add_model)
                .layer(DefaultBodyLimit::max(MODEL_UPLOAD_LIMIT)),
        )
        .route(
            "/api/custom-network/list/:name",
            get(handlers::get_model)
                .put(upload::update_model)
                .delete(handlers::delete_model)
                .layer(DefaultBodyLimit::max(MODEL_UPLOAD_LIMIT)),
        )
        // 设备侧模型选择
        .route(
            "/api/custom-network/selected",
            get(handlers::get_selected).post(handlers::select_model),
        )
        // 推流控制
        .route("/api/stream/control", post(handlers::stream_control))
        .route("/api/stream/frames", get(sse::stream_frames))
        // 健康检查
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
