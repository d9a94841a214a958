// 模型上传与更新
//
// Both routes take `multipart/form-data`: text fields for the record plus a
// `network` file and an optional `labels` file. Files land in the model's own
// directory under the store.

use super::error::ApiError;
use super::handlers::{model_info, ApiResponse, ApiResult, AppState, ModelInfo};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, State},
    Json,
};
use common::model::{ModelRecord, ModelStore, TomlModelStore};
use common::RelayError;
use std::collections::HashMap;
use std::fs;
use tracing::{info, warn};

/// Upper bound for one upload request.
pub const MODEL_UPLOAD_LIMIT: usize = 512 * 1024 * 1024;

const DEFAULT_NETWORK_FILE: &str = "network.rpk";
const DEFAULT_LABELS_FILE: &str = "labels.txt";

struct Upload {
    file_name: String,
    data: Bytes,
}

#[derive(Default)]
struct ModelForm {
    fields: HashMap<String, String>,
    network: Option<Upload>,
    labels: Option<Upload>,
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl ModelForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match name.as_str() {
                "network" | "labels" => {
                    let file_name = field.file_name().unwrap_or_default().to_string();
                    let data = field.bytes().await?;
                    // browsers send an empty part for an untouched file input
                    if file_name.is_empty() && data.is_empty() {
                        continue;
                    }
                    let default_name = if name == "network" {
                        DEFAULT_NETWORK_FILE
                    } else {
                        DEFAULT_LABELS_FILE
                    };
                    let upload = Upload {
                        file_name: if file_name.is_empty() {
                            default_name.to_string()
                        } else {
                            file_name
                        },
                        data,
                    };
                    if name == "network" {
                        form.network = Some(upload);
                    } else {
                        form.labels = Some(upload);
                    }
                }
                _ => {
                    let value = field.text().await?;
                    form.fields.insert(name, value);
                }
            }
        }
        Ok(form)
    }

    /// Non-blank text field.
    fn optional(&mut self, name: &str) -> Option<String> {
        self.fields
            .remove(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&mut self, name: &str) -> Result<String, ApiError> {
        self.optional(name)
            .ok_or_else(|| ApiError::BadRequest(format!("missing field '{}'", name)))
    }
}

/// Model names double as directory names.
fn check_model_name(name: &str) -> Result<(), ApiError> {
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ApiError::BadRequest(format!("invalid model name '{}'", name)));
    }
    Ok(())
}

fn parse_flag(value: &str) -> Result<String, ApiError> {
    match value.to_lowercase().as_str() {
        "true" => Ok("true".to_string()),
        "false" => Ok("false".to_string()),
        _ => Err(ApiError::BadRequest(format!(
            "preserve_aspect_ratio must be true or false, got '{}'",
            value
        ))),
    }
}

/// Deletes a file the record is about to stop pointing at, if the store owns it.
fn remove_replaced(store: &TomlModelStore, name: &str, old_path: &str) {
    let old_path = std::path::Path::new(old_path);
    if !old_path.starts_with(store.dir_for(name)) || !old_path.is_file() {
        return;
    }
    if let Err(e) = fs::remove_file(old_path) {
        warn!("Failed to remove replaced file {:?}: {}", old_path, e);
    }
}

/// 新增模型
pub async fn add_model(State(state): State<AppState>, multipart: Multipart) -> ApiResult<ModelInfo> {
    let mut form = ModelForm::read(multipart).await?;
    let name = form.required("network_name")?;
    check_model_name(&name)?;
    let model_type = form.required("network_type")?;
    let post_processor = form.required("post_processor")?;
    let color_format = form.required("color_format")?;
    let preserve = parse_flag(&form.required("preserve_aspect_ratio")?)?;
    let network = form
        .network
        .take()
        .ok_or_else(|| ApiError::BadRequest("missing file 'network'".to_string()))?;
    let labels = form.labels.take();

    let store = state.store.clone();
    let created = name.clone();
    tokio::task::spawn_blocking(move || -> common::Result<()> {
        match store.get(&name) {
            Ok(_) => return Err(RelayError::ModelExists(name)),
            Err(RelayError::ModelNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let model_file = store.write_file(&name, &network.file_name, &network.data)?;
        let labels_file = labels
            .map(|labels| store.write_file(&name, &labels.file_name, &labels.data))
            .transpose()?;

        store.put(ModelRecord {
            model_name: name,
            model_file: model_file.to_string_lossy().into_owned(),
            model_type,
            model_post_processor: post_processor,
            model_color_format: color_format,
            model_preserve_aspect_ratio: preserve,
            labels_file: labels_file.map(|path| path.to_string_lossy().into_owned()),
        })
    })
    .await??;

    info!("✓ Model '{}' uploaded", created);
    let info = model_info(state.store.clone(), created).await?;
    Ok(Json(ApiResponse::success(info)))
}

/// 更新模型：可改名、改元数据、替换文件
pub async fn update_model(
    Path(name): Path<String>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<ModelInfo> {
    let mut form = ModelForm::read(multipart).await?;
    let new_name = form.optional("new_network_name");
    if let Some(new_name) = &new_name {
        check_model_name(new_name)?;
    }
    let model_type = form.optional("network_type");
    let post_processor = form.optional("post_processor");
    let color_format = form.optional("color_format");
    let preserve = form
        .optional("preserve_aspect_ratio")
        .map(|value| parse_flag(&value))
        .transpose()?;
    let network = form.network.take();
    let labels = form.labels.take();

    let store = state.store.clone();
    let current = tokio::task::spawn_blocking(move || -> common::Result<String> {
        let mut current = name;
        if let Some(new_name) = new_name.filter(|new_name| *new_name != current) {
            store.rename(&current, &new_name)?;
            current = new_name;
        }

        let mut record = store.get(&current)?;
        if let Some(model_type) = model_type {
            record.model_type = model_type;
        }
        if let Some(post_processor) = post_processor {
            record.model_post_processor = post_processor;
        }
        if let Some(color_format) = color_format {
            record.model_color_format = color_format;
        }
        if let Some(preserve) = preserve {
            record.model_preserve_aspect_ratio = preserve;
        }
        if let Some(network) = network {
            remove_replaced(&store, &current, &record.model_file);
            let path = store.write_file(&current, &network.file_name, &network.data)?;
            record.model_file = path.to_string_lossy().into_owned();
        }
        if let Some(labels) = labels {
            if let Some(old) = &record.labels_file {
                remove_replaced(&store, &current, old);
            }
            let path = store.write_file(&current, &labels.file_name, &labels.data)?;
            record.labels_file = Some(path.to_string_lossy().into_owned());
        }

        store.update(record)?;
        Ok(current)
    })
    .await??;

    info!("✓ Model '{}' updated", current);
    let info = model_info(state.store.clone(), current).await?;
    Ok(Json(ApiResponse::success(info)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::tests::{request, send, test_state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    const BOUNDARY: &str = "edgecam-boundary";

    fn multipart(method: &str, uri: &str, fields: &[(&str, &str)], files: &[(&str, &str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        for (name, file_name, data) in files {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY, name, file_name
                )
                .as_bytes(),
            );
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn new_model_fields(name: &str) -> Vec<(&str, &str)> {
        vec![
            ("network_name", name),
            ("network_type", "rpk"),
            ("post_processor", "pp_cls"),
            ("color_format", "BGR"),
            ("preserve_aspect_ratio", "True"),
        ]
    }

    #[tokio::test]
    async fn test_add_model_writes_files_into_model_dir() {
        let (state, _home) = test_state();

        let upload = multipart(
            "POST",
            "/api/custom-network/list",
            &new_model_fields("resnet"),
            &[
                ("network", "resnet.rpk", "weights"),
                ("labels", "classes.txt", "cat\ndog\n"),
            ],
        );
        let (status, body) = send(&state, upload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["model_name"], "resnet");
        assert_eq!(body["data"]["model_preserve_aspect_ratio"], "true");
        assert_eq!(body["data"]["labels"], json!(["cat", "dog"]));

        let dir = state.store.dir_for("resnet");
        assert_eq!(fs::read(dir.join("resnet.rpk")).unwrap(), b"weights");
        let record = state.store.get("resnet").unwrap();
        assert_eq!(record.model_file, dir.join("resnet.rpk").to_string_lossy());
        assert!(record.validate().is_ok());

        let (_, body) = request(&state, "GET", "/api/custom-network/list", None).await;
        assert_eq!(body["data"], json!(["mobilenet", "resnet", "yolo"]));
    }

    #[tokio::test]
    async fn test_add_model_rejects_duplicates_and_incomplete_forms() {
        let (state, _home) = test_state();

        let duplicate = multipart(
            "POST",
            "/api/custom-network/list",
            &new_model_fields("yolo"),
            &[("network", "yolo.rpk", "weights")],
        );
        let (status, body) = send(&state, duplicate).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "error");
        assert!(!state.store.dir_for("yolo").join("yolo.rpk").exists());

        let no_file = multipart("POST", "/api/custom-network/list", &new_model_fields("resnet"), &[]);
        let (status, _) = send(&state, no_file).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let bad_name = multipart(
            "POST",
            "/api/custom-network/list",
            &new_model_fields("../resnet"),
            &[("network", "resnet.rpk", "weights")],
        );
        let (status, _) = send(&state, bad_name).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_model_renames_and_replaces_files() {
        let (state, _home) = test_state();

        let add = multipart(
            "POST",
            "/api/custom-network/list",
            &new_model_fields("resnet"),
            &[("network", "resnet.rpk", "v1")],
        );
        assert_eq!(send(&state, add).await.0, StatusCode::OK);

        let update = multipart(
            "PUT",
            "/api/custom-network/list/resnet",
            &[
                ("new_network_name", "resnet50"),
                ("post_processor", "pp_cls_softmax"),
                ("network_type", ""),
            ],
            &[
                ("network", "resnet50.rpk", "v2"),
                ("labels", "labels.txt", "person\n"),
            ],
        );
        let (status, body) = send(&state, update).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["model_name"], "resnet50");
        assert_eq!(body["data"]["model_post_processor"], "pp_cls_softmax");
        // blank fields leave the value unchanged
        assert_eq!(body["data"]["model_type"], "rpk");
        assert_eq!(body["data"]["labels"], json!(["person"]));

        let new_dir = state.store.dir_for("resnet50");
        assert!(!state.store.dir_for("resnet").exists());
        assert!(!new_dir.join("resnet.rpk").exists());
        assert_eq!(fs::read(new_dir.join("resnet50.rpk")).unwrap(), b"v2");
        assert_eq!(
            state.store.get("resnet50").unwrap().model_file,
            new_dir.join("resnet50.rpk").to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_update_model_errors() {
        let (state, _home) = test_state();

        let missing = multipart("PUT", "/api/custom-network/list/missing", &[("network_type", "rpk")], &[]);
        assert_eq!(send(&state, missing).await.0, StatusCode::NOT_FOUND);

        let clash = multipart(
            "PUT",
            "/api/custom-network/list/mobilenet",
            &[("new_network_name", "yolo")],
            &[],
        );
        assert_eq!(send(&state, clash).await.0, StatusCode::CONFLICT);
        assert!(state.store.get("mobilenet").is_ok());

        let bad_flag = multipart(
            "PUT",
            "/api/custom-network/list/mobilenet",
            &[("preserve_aspect_ratio", "maybe")],
            &[],
        );
        assert_eq!(send(&state, bad_flag).await.0, StatusCode::BAD_REQUEST);
    }
}
