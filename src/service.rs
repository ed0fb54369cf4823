// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/service.rs - 分割服务
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

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use axum::body::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  detection::{self, Detection, NormalizeError},
  input::{self, InputError},
  mask::MaskCodecError,
  model::{ModelKind, ModelMetadata, PredictionBatch, PredictorError, VERTEBRA_CLASSES},
  output::{self, Annotation, Draw, OutputError},
  registry::{ModelRegistry, RegistryError},
};

#[derive(Error, Debug)]
pub enum ServiceError {
  #[error(transparent)]
  Input(#[from] InputError),
  #[error(transparent)]
  Registry(#[from] RegistryError),
  #[error(transparent)]
  Normalize(#[from] NormalizeError),
  #[error(transparent)]
  MaskCodec(#[from] MaskCodecError),
  #[error(transparent)]
  Output(#[from] OutputError),
  #[error("Inference failed: {0}")]
  InferenceFailure(String),
}

impl From<PredictorError> for ServiceError {
  fn from(err: PredictorError) -> Self {
    ServiceError::InferenceFailure(err.to_string())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
  pub detections: Vec<Detection>,
  pub num_detections: usize,
  pub image_shape: [usize; 3],
  pub processing_time_ms: f64,
  pub model_used: ModelKind,
}

/// 可视化结果，PNG 字节加上响应头需要的统计信息
#[derive(Debug, Clone)]
pub struct VisualizationResponse {
  pub png: Vec<u8>,
  pub num_detections: usize,
  pub processing_time_ms: f64,
  pub model_used: ModelKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
  pub status: String,
  pub model_loaded: bool,
  pub model_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsInfoResponse {
  pub models: BTreeMap<ModelKind, ModelMetadata>,
  pub default_model: ModelKind,
}

pub struct SegmentationService {
  registry: Arc<ModelRegistry>,
  draw: Arc<Draw>,
  model_cache_dir: PathBuf,
  score_threshold: f32,
}

impl SegmentationService {
  pub fn new(
    registry: Arc<ModelRegistry>,
    model_cache_dir: impl Into<PathBuf>,
    score_threshold: f32,
  ) -> Result<Self, ServiceError> {
    Ok(Self {
      registry,
      draw: Arc::new(Draw::new()?),
      model_cache_dir: model_cache_dir.into(),
      score_threshold,
    })
  }

  pub fn registry(&self) -> &ModelRegistry {
    &self.registry
  }

  pub fn default_model(&self) -> ModelKind {
    self.registry.default_model()
  }

  /// 分割并返回结构化检测结果
  pub async fn predict(
    &self,
    image_bytes: Bytes,
    model: Option<&str>,
  ) -> Result<PredictionResponse, ServiceError> {
    let image = decode_upload(image_bytes).await?;
    let predictor = self.registry.resolve(model).await?;

    let (batch, detections) = tokio::task::spawn_blocking(move || {
      let batch = predictor.infer(&image)?;
      let detections = detection::normalize(&batch, &VERTEBRA_CLASSES)?;
      for det in &detections {
        let area = det.mask.area()?;
        debug!("{}: score {:.3}, 掩码面积 {}", det.class_name, det.score, area);
      }
      Ok::<_, ServiceError>((batch, detections))
    })
    .await
    .map_err(|e| ServiceError::InferenceFailure(e.to_string()))??;

    info!(
      "使用 {} 预测成功，检测到 {} 个椎骨",
      batch.model,
      batch.num_detections()
    );

    Ok(PredictionResponse {
      num_detections: detections.len(),
      detections,
      image_shape: batch.image_shape,
      processing_time_ms: batch.processing_time_ms,
      model_used: batch.model,
    })
  }

  /// 分割并返回标注后的 PNG 图像
  pub async fn visualize(
    &self,
    image_bytes: Bytes,
    model: Option<&str>,
  ) -> Result<VisualizationResponse, ServiceError> {
    let image = decode_upload(image_bytes).await?;
    let predictor = self.registry.resolve(model).await?;
    let draw = self.draw.clone();
    let score_threshold = self.score_threshold;

    let (batch, png) = tokio::task::spawn_blocking(move || {
      let batch = predictor.infer(&image)?;
      let annotated = render_batch(&draw, &image, &batch, score_threshold)?;
      let png = output::encode_png(&annotated)?;
      Ok::<_, ServiceError>((batch, png))
    })
    .await
    .map_err(|e| ServiceError::InferenceFailure(e.to_string()))??;

    info!(
      "使用 {} 可视化成功，标注 {} 个椎骨",
      batch.model,
      batch.num_detections()
    );

    Ok(VisualizationResponse {
      png,
      num_detections: batch.num_detections(),
      processing_time_ms: batch.processing_time_ms,
      model_used: batch.model,
    })
  }

  pub fn health(&self) -> HealthResponse {
    let model_loaded = !self.registry.describe_all().is_empty();
    if !model_loaded {
      warn!("健康检查: 没有就绪的模型");
    }

    HealthResponse {
      status: if model_loaded { "healthy" } else { "unhealthy" }.to_string(),
      model_loaded,
      model_path: model_loaded.then(|| self.model_cache_dir.display().to_string()),
    }
  }

  pub fn models_info(&self) -> ModelsInfoResponse {
    ModelsInfoResponse {
      models: self
        .registry
        .describe_all()
        .into_iter()
        .map(|meta| (meta.model_type, meta))
        .collect(),
      default_model: self.registry.default_model(),
    }
  }

  pub async fn model_info(&self, model: Option<&str>) -> Result<ModelMetadata, ServiceError> {
    Ok(self.registry.model_info(model).await?)
  }
}

/// 在阻塞线程池中解码上传的图像
async fn decode_upload(image_bytes: Bytes) -> Result<RgbImage, ServiceError> {
  let image = tokio::task::spawn_blocking(move || input::decode_image(&image_bytes))
    .await
    .map_err(|e| ServiceError::InferenceFailure(e.to_string()))??;
  Ok(image)
}

fn render_batch(
  draw: &Draw,
  image: &RgbImage,
  batch: &PredictionBatch,
  score_threshold: f32,
) -> Result<RgbImage, ServiceError> {
  let annotations = batch
    .items
    .iter()
    .map(|item| {
      Ok(Annotation {
        bbox: item.bbox,
        mask: &item.mask,
        score: item.score,
        label: detection::class_name(&VERTEBRA_CLASSES, item.class_id)?,
      })
    })
    .collect::<Result<Vec<_>, NormalizeError>>()?;

  Ok(draw.render(image, &annotations, score_threshold))
}
