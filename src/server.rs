// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/server.rs - HTTP 接口
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{collections::BTreeMap, sync::Arc};

use axum::{
  Json, Router,
  body::Bytes,
  extract::{DefaultBodyLimit, Multipart, Query, State, multipart::MultipartRejection},
  http::{HeaderName, HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
  routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
  model::{ModelKind, ModelMetadata},
  registry::RegistryError,
  service::{
    HealthResponse, ModelsInfoResponse, PredictionResponse, SegmentationService, ServiceError,
  },
};

const SERVICE_NAME: &str = "Vertebrae Segmentation API";
const SERVICE_DESCRIPTION: &str = "Multi-model segmentation for 17 vertebrae classes";
const UPLOAD_FIELD: &str = "file";

const X_NUM_DETECTIONS: HeaderName = HeaderName::from_static("x-num-detections");
const X_PROCESSING_TIME_MS: HeaderName = HeaderName::from_static("x-processing-time-ms");
const X_MODEL_USED: HeaderName = HeaderName::from_static("x-model-used");

#[derive(Error, Debug)]
pub enum ApiError {
  #[error(transparent)]
  Service(#[from] ServiceError),
  #[error("Empty file uploaded")]
  EmptyFile,
  #[error("Field required: file")]
  MissingFile,
  #[error("{detail}")]
  Upload { status: StatusCode, detail: String },
  #[error("Invalid response header: {0}")]
  Header(String),
}

/// 错误响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub detail: String,
  pub error_type: String,
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::Service(ServiceError::Input(_)) => StatusCode::BAD_REQUEST,
      ApiError::Service(ServiceError::Registry(RegistryError::UnknownModelType(_))) => {
        StatusCode::BAD_REQUEST
      }
      ApiError::Service(ServiceError::Registry(RegistryError::ModelNotReady { .. })) => {
        StatusCode::SERVICE_UNAVAILABLE
      }
      ApiError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
      ApiError::EmptyFile => StatusCode::BAD_REQUEST,
      ApiError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
      ApiError::Upload { status, .. } => *status,
      ApiError::Header(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn error_type(&self) -> &'static str {
    match self {
      ApiError::Service(ServiceError::Input(_)) => "InvalidImage",
      ApiError::Service(ServiceError::Registry(RegistryError::UnknownModelType(_))) => {
        "UnknownModelType"
      }
      ApiError::Service(ServiceError::Registry(RegistryError::ModelNotReady { .. })) => {
        "ModelNotReady"
      }
      ApiError::Service(ServiceError::Registry(RegistryError::LoadFailed { .. })) => {
        "ModelLoadFailed"
      }
      ApiError::Service(ServiceError::Normalize(_)) => "ClassIndexOutOfRange",
      ApiError::Service(ServiceError::MaskCodec(_)) => "MalformedRle",
      ApiError::Service(ServiceError::Output(_)) => "VisualizationFailure",
      ApiError::Service(ServiceError::InferenceFailure(_)) => "InferenceFailure",
      ApiError::EmptyFile => "EmptyFile",
      ApiError::MissingFile => "MissingFile",
      ApiError::Upload { .. } => "InvalidUpload",
      ApiError::Header(_) => "InternalError",
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!("请求处理失败: {}", self);
    } else {
      warn!("请求被拒绝: {}", self);
    }

    let body = ErrorResponse {
      detail: self.to_string(),
      error_type: self.error_type().to_string(),
    };
    (status, Json(body)).into_response()
  }
}

#[derive(Clone)]
struct AppState {
  service: Arc<SegmentationService>,
}

#[derive(Debug, Deserialize)]
struct ModelQuery {
  model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
  pub name: String,
  pub version: String,
  pub description: String,
  pub supported_models: Vec<ModelKind>,
  pub default_model: ModelKind,
  pub endpoints: BTreeMap<String, String>,
}

pub fn create_app(service: Arc<SegmentationService>, max_upload_bytes: usize) -> Router {
  Router::new()
    .route("/", get(root_handler))
    .route("/health", get(health_handler))
    .route("/models", get(models_handler))
    .route("/model-info", get(model_info_handler))
    .route("/predict", post(predict_handler))
    .route("/predict/visualize", post(visualize_handler))
    .layer(DefaultBodyLimit::max(max_upload_bytes))
    .layer(TraceLayer::new_for_http())
    .with_state(AppState { service })
}

/// 绑定地址并提供服务，收到 Ctrl-C 后优雅退出
pub async fn serve(app: Router, addr: &str) -> std::io::Result<()> {
  let listener = TcpListener::bind(addr).await?;
  info!("API 服务监听于 {}", listener.local_addr()?);
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到退出信号，正在关闭服务..."),
    Err(e) => {
      error!("无法监听退出信号: {}", e);
      std::future::pending::<()>().await;
    }
  }
}

async fn root_handler(State(state): State<AppState>) -> Json<RootResponse> {
  let endpoints = [
    (
      "POST /predict",
      "Run segmentation inference (supports ?model=yolo or ?model=maskrcnn)",
    ),
    (
      "POST /predict/visualize",
      "Run inference and return annotated image",
    ),
    ("GET /health", "Health check"),
    ("GET /models", "Information about all available models"),
    ("GET /model-info", "Information about specific model"),
  ]
  .into_iter()
  .map(|(k, v)| (k.to_string(), v.to_string()))
  .collect();

  Json(RootResponse {
    name: SERVICE_NAME.to_string(),
    version: env!("CARGO_PKG_VERSION").to_string(),
    description: SERVICE_DESCRIPTION.to_string(),
    supported_models: state.service.registry().registered().collect(),
    default_model: state.service.default_model(),
    endpoints,
  })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
  Json(state.service.health())
}

async fn models_handler(State(state): State<AppState>) -> Json<ModelsInfoResponse> {
  Json(state.service.models_info())
}

async fn model_info_handler(
  State(state): State<AppState>,
  Query(query): Query<ModelQuery>,
) -> Result<Json<ModelMetadata>, ApiError> {
  let info = state.service.model_info(query.model.as_deref()).await?;
  Ok(Json(info))
}

async fn predict_handler(
  State(state): State<AppState>,
  Query(query): Query<ModelQuery>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
  let image_bytes = read_upload(multipart).await?;
  let response = state
    .service
    .predict(image_bytes, query.model.as_deref())
    .await?;
  Ok(Json(response))
}

async fn visualize_handler(
  State(state): State<AppState>,
  Query(query): Query<ModelQuery>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
  let image_bytes = read_upload(multipart).await?;
  let result = state
    .service
    .visualize(image_bytes, query.model.as_deref())
    .await?;

  let processing_time = HeaderValue::try_from(result.processing_time_ms.to_string())
    .map_err(|e| ApiError::Header(e.to_string()))?;
  let headers = [
    (header::CONTENT_TYPE, HeaderValue::from_static("image/png")),
    (X_NUM_DETECTIONS, HeaderValue::from(result.num_detections)),
    (X_PROCESSING_TIME_MS, processing_time),
    (X_MODEL_USED, HeaderValue::from_static(result.model_used.as_str())),
  ];
  Ok((headers, result.png).into_response())
}

/// 取出名为 `file` 的上传字段
async fn read_upload(multipart: Result<Multipart, MultipartRejection>) -> Result<Bytes, ApiError> {
  let mut multipart = multipart.map_err(|rejection| ApiError::Upload {
    status: StatusCode::UNPROCESSABLE_ENTITY,
    detail: rejection.body_text(),
  })?;

  let upload_error = |e: axum::extract::multipart::MultipartError| ApiError::Upload {
    status: e.status(),
    detail: e.body_text(),
  };

  while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }
    let bytes = field.bytes().await.map_err(upload_error)?;
    if bytes.is_empty() {
      return Err(ApiError::EmptyFile);
    }
    return Ok(bytes);
  }

  Err(ApiError::MissingFile)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{detection::NormalizeError, mask::MaskCodecError};

  #[test]
  fn test_internal_error_kinds() {
    let malformed = ApiError::from(ServiceError::MaskCodec(MaskCodecError::Truncated));
    assert_eq!(malformed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(malformed.error_type(), "MalformedRle");

    let out_of_range = ApiError::from(ServiceError::Normalize(
      NormalizeError::ClassIndexOutOfRange { index: 17, len: 17 },
    ));
    assert_eq!(out_of_range.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(out_of_range.error_type(), "ClassIndexOutOfRange");
  }
}
