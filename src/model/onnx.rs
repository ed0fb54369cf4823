// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 会话
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

use std::{
  path::Path,
  sync::{Mutex, MutexGuard},
};

use ort::{
  execution_providers::CPUExecutionProvider,
  session::{Session, builder::GraphOptimizationLevel},
};
use tracing::{debug, info};

use crate::model::{ModelKind, PredictorError};

const ONNX_INTRA_THREADS: usize = 4;

/// 加载完成后的推理会话
pub(crate) struct OnnxSession {
  session: Mutex<Session>,
  input_name: String,
  model: ModelKind,
}

impl OnnxSession {
  pub(crate) fn open(path: &Path, model: ModelKind) -> Result<Self, PredictorError> {
    info!("加载 ONNX 模型: {}", path.display());
    let session = Session::builder()
      .map_err(PredictorError::runtime)?
      .with_execution_providers([CPUExecutionProvider::default().build()])
      .map_err(PredictorError::runtime)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(PredictorError::runtime)?
      .with_intra_threads(ONNX_INTRA_THREADS)
      .map_err(PredictorError::runtime)?
      .commit_from_file(path)
      .map_err(PredictorError::runtime)?;

    let input_name = session
      .inputs
      .first()
      .map(|input| input.name.clone())
      .ok_or_else(|| PredictorError::InvalidOutput("model declares no inputs".to_string()))?;

    debug!(
      "模型 {} 输入: {}, 输出数量: {}",
      model,
      input_name,
      session.outputs.len()
    );

    Ok(Self {
      session: Mutex::new(session),
      input_name,
      model,
    })
  }

  pub(crate) fn input_name(&self) -> &str {
    &self.input_name
  }

  pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Session>, PredictorError> {
    self
      .session
      .lock()
      .map_err(|_| PredictorError::Runtime(format!("session of '{}' is poisoned", self.model)))
  }
}

pub(crate) fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

/// 计算两个边界框的 IoU，bbox 为 [x_min, y_min, x_max, y_max]
pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_iou() {
    let a = [0.0, 0.0, 10.0, 10.0];
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    let half = iou(&a, &[5.0, 0.0, 15.0, 10.0]);
    assert!((half - 50.0 / 150.0).abs() < 1e-6);
  }

  #[test]
  fn test_sigmoid() {
    assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
    assert!(sigmoid(10.0) > 0.99);
  }
}
