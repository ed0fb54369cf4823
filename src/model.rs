// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/model.rs - 模型
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

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  artifact::{ArtifactError, ArtifactFetcher},
  mask::BinaryMask,
};

/// 椎骨类别表（T1-T12, L1-L5），顺序即模型输出的类别索引
pub const VERTEBRA_CLASSES: [&str; 17] = [
  "T1", "T2", "T3", "T4", "T5", "T6", "T7", "T8", "T9", "T10", "T11", "T12", "L1", "L2", "L3",
  "L4", "L5",
];

/// 支持的模型类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
  Yolo,
  MaskRcnn,
}

impl ModelKind {
  pub const ALL: [ModelKind; 2] = [ModelKind::Yolo, ModelKind::MaskRcnn];

  pub fn as_str(&self) -> &'static str {
    match self {
      ModelKind::Yolo => "yolo",
      ModelKind::MaskRcnn => "maskrcnn",
    }
  }
}

impl fmt::Display for ModelKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown model type '{0}', expected one of: yolo, maskrcnn")]
pub struct UnknownModelKind(pub String);

impl FromStr for ModelKind {
  type Err = UnknownModelKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ModelKind::ALL
      .into_iter()
      .find(|kind| kind.as_str() == s)
      .ok_or_else(|| UnknownModelKind(s.to_string()))
  }
}

/// 模型描述信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
  pub model_name: String,
  pub model_type: ModelKind,
  pub num_classes: usize,
  pub classes: Vec<String>,
  pub backbone: String,
  pub device: String,
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub framework: String,
}

/// 单个原始检测结果
#[derive(Debug, Clone)]
pub struct DetectItem {
  pub class_id: usize,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
  pub mask: BinaryMask,
}

/// 一次推理的原始输出
#[derive(Debug, Clone)]
pub struct PredictionBatch {
  pub items: Box<[DetectItem]>,
  /// [高, 宽, 通道]
  pub image_shape: [usize; 3],
  pub processing_time_ms: f64,
  pub model: ModelKind,
}

impl PredictionBatch {
  pub fn num_detections(&self) -> usize {
    self.items.len()
  }
}

#[derive(Error, Debug)]
pub enum PredictorError {
  #[error("model '{0}' is not loaded")]
  NotLoaded(ModelKind),
  #[error("artifact error: {0}")]
  Artifact(#[from] ArtifactError),
  #[error("inference runtime error: {0}")]
  Runtime(String),
  #[error("unexpected model output: {0}")]
  InvalidOutput(String),
}

impl PredictorError {
  pub fn runtime(e: impl fmt::Display) -> Self {
    PredictorError::Runtime(e.to_string())
  }
}

/// 推理后端的统一接口
///
/// 每个模型变体只需实现加载、推理与描述三项能力，
/// 注册表按 [`ModelKind`] 统一管理。
#[async_trait]
pub trait Predictor: Send + Sync {
  fn kind(&self) -> ModelKind;

  /// 拉取权重并构建推理会话，只会被注册表调用一次
  async fn load(&self, fetcher: &dyn ArtifactFetcher) -> Result<(), PredictorError>;

  fn infer(&self, image: &RgbImage) -> Result<PredictionBatch, PredictorError>;

  fn describe(&self) -> ModelMetadata;
}

/// 预测器共用的推理参数
#[derive(Debug, Clone)]
pub struct InferenceOptions {
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub max_detections: usize,
  pub device: String,
}

impl Default for InferenceOptions {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.5,
      nms_threshold: 0.5,
      max_detections: 100,
      device: "cpu".to_string(),
    }
  }
}

impl InferenceOptions {
  pub(crate) fn metadata(
    &self,
    kind: ModelKind,
    model_name: &str,
    backbone: &str,
    framework: &str,
  ) -> ModelMetadata {
    ModelMetadata {
      model_name: model_name.to_string(),
      model_type: kind,
      num_classes: VERTEBRA_CLASSES.len(),
      classes: VERTEBRA_CLASSES.iter().map(|c| c.to_string()).collect(),
      backbone: backbone.to_string(),
      device: self.device.clone(),
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      framework: framework.to_string(),
    }
  }
}

#[cfg(feature = "model_yolo")]
mod yolo;
#[cfg(feature = "model_yolo")]
pub use self::yolo::YoloPredictor;

#[cfg(feature = "model_maskrcnn")]
mod maskrcnn;
#[cfg(feature = "model_maskrcnn")]
pub use self::maskrcnn::MaskRcnnPredictor;

#[cfg(any(feature = "model_yolo", feature = "model_maskrcnn"))]
mod onnx;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_model_kind_parse() {
    assert_eq!("yolo".parse::<ModelKind>().unwrap(), ModelKind::Yolo);
    assert_eq!("maskrcnn".parse::<ModelKind>().unwrap(), ModelKind::MaskRcnn);
    assert_eq!(
      "bogus".parse::<ModelKind>(),
      Err(UnknownModelKind("bogus".to_string()))
    );
    assert!("YOLO".parse::<ModelKind>().is_err());
  }

  #[test]
  fn test_model_kind_serde() {
    assert_eq!(
      serde_json::to_string(&ModelKind::MaskRcnn).unwrap(),
      "\"maskrcnn\""
    );
  }

  #[test]
  fn test_class_table() {
    assert_eq!(VERTEBRA_CLASSES.len(), 17);
    assert_eq!(VERTEBRA_CLASSES[0], "T1");
    assert_eq!(VERTEBRA_CLASSES[5], "T6");
    assert_eq!(VERTEBRA_CLASSES[16], "L5");
  }

  #[test]
  fn test_metadata_from_options() {
    let meta = InferenceOptions::default().metadata(
      ModelKind::Yolo,
      "YOLOv8-seg",
      "YOLOv8",
      "ONNX Runtime",
    );
    assert_eq!(meta.num_classes, 17);
    assert_eq!(meta.classes.len(), 17);
    assert_eq!(meta.model_type, ModelKind::Yolo);
    assert_eq!(meta.device, "cpu");
  }
}
