use super::error::ApiError;
use crate::device::DeviceManager;
use crate::distribution::FrameHub;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use common::model::{ModelRecord, ModelStore, TomlModelStore};
use common::{ControlEvent, ControlResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub device_manager: DeviceManager,
    pub frame_hub: FrameHub,
    pub store: Arc<TomlModelStore>,
    /// Client that selection and stream control requests go to.
    pub target_client_id: Arc<str>,
    pub call_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub(super) fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub(super) fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

pub(super) type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// 模型详情：存储记录加上标签
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    #[serde(flatten)]
    pub record: ModelRecord,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SelectQuery {
    pub network: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamControlRequest {
    pub action: String,
}

/// 健康检查
pub async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}

/// 模型名称列表
pub async fn list_models(State(state): State<AppState>) -> ApiResult<Vec<String>> {
    let store = state.store.clone();
    let records = tokio::task::spawn_blocking(move || store.list()).await??;
    let names = records.into_iter().map(|record| record.model_name).collect();
    Ok(Json(ApiResponse::success(names)))
}

pub async fn get_model(Path(name): Path<String>, State(state): State<AppState>) -> ApiResult<ModelInfo> {
    let info = model_info(state.store.clone(), name).await?;
    Ok(Json(ApiResponse::success(info)))
}

/// Removes the record and its directory. A device that still has the model
/// selected finds out when it next starts.
pub async fn delete_model(Path(name): Path<String>, State(state): State<AppState>) -> ApiResult<String> {
    let store = state.store.clone();
    let deleted = name.clone();
    tokio::task::spawn_blocking(move || store.delete(&deleted)).await??;
    Ok(Json(ApiResponse::success(name)))
}

/// 查询设备当前选中的模型
pub async fn get_selected(State(state): State<AppState>) -> ApiResult<Option<ModelInfo>> {
    let response = state
        .device_manager
        .call(&state.target_client_id, &ControlEvent::GetSelected, state.call_timeout)
        .await?;

    let info = match response {
        ControlResponse::Selected { selected_model: Some(name) } => {
            Some(model_info(state.store.clone(), name).await?)
        }
        ControlResponse::Selected { selected_model: None } => None,
        ControlResponse::Error { error } => return Err(ApiError::Internal(error)),
    };
    Ok(Json(ApiResponse::success(info)))
}

/// 让设备选择模型，设备的响应原样返回
pub async fn select_model(
    Query(query): Query<SelectQuery>,
    State(state): State<AppState>,
) -> ApiResult<ControlResponse> {
    let event = ControlEvent::Select { network: query.network };
    let response = state
        .device_manager
        .call(&state.target_client_id, &event, state.call_timeout)
        .await?;
    info!("Select response from {}: {:?}", state.target_client_id, response);
    Ok(Json(ApiResponse::success(response)))
}

/// 启停推流
pub async fn stream_control(
    State(state): State<AppState>,
    Json(request): Json<StreamControlRequest>,
) -> ApiResult<String> {
    let event = match request.action.as_str() {
        "start" => ControlEvent::Start,
        "stop" => ControlEvent::Stop,
        other => return Err(ApiError::BadRequest(format!("unsupported action '{}'", other))),
    };
    state.device_manager.send(&state.target_client_id, &event).await?;
    Ok(Json(ApiResponse::success(request.action)))
}

pub(super) async fn model_info(store: Arc<TomlModelStore>, name: String) -> Result<ModelInfo, ApiError> {
    let info = tokio::task::spawn_blocking(move || -> common::Result<ModelInfo> {
        let record = store.get(&name)?;
        let labels = store.labels(&name)?;
        Ok(ModelInfo { record, labels })
    })
    .await??;
    Ok(info)
}
