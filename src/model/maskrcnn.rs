// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/model/maskrcnn.rs - Mask R-CNN 分割模型
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

use std::{sync::OnceLock, time::Instant};

use async_trait::async_trait;
use image::RgbImage;
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView3, Axis, Ix1, Ix2, Ix4, s};
use ort::value::Value;
use tracing::{debug, info};

use crate::{
  artifact::{ArtifactFetcher, ArtifactSource},
  frame::{ChannelOrder, NchwFrame},
  input,
  mask::BinaryMask,
  model::{
    DetectItem, InferenceOptions, ModelKind, ModelMetadata, PredictionBatch, Predictor,
    PredictorError, onnx::OnnxSession,
  },
};

const MASKRCNN_MASK_THRESH: f32 = 0.5;
const MASKRCNN_CACHE_NAME: &str = "maskrcnn_model.onnx";

/// 追踪导出的 Mask R-CNN 模型
///
/// 输入为 `[3, H, W]` 的 BGR 图像（0-255），
/// 输出依次为 boxes `[N, 4]`、classes `[N]`、masks `[N, 1, M, M]`、scores `[N]`。
pub struct MaskRcnnPredictor {
  source: ArtifactSource,
  options: InferenceOptions,
  backbone: String,
  session: OnceLock<OnnxSession>,
}

impl MaskRcnnPredictor {
  pub fn new(source: ArtifactSource, options: InferenceOptions, backbone: impl Into<String>) -> Self {
    Self {
      source,
      options,
      backbone: backbone.into(),
      session: OnceLock::new(),
    }
  }
}

#[async_trait]
impl Predictor for MaskRcnnPredictor {
  fn kind(&self) -> ModelKind {
    ModelKind::MaskRcnn
  }

  async fn load(&self, fetcher: &dyn ArtifactFetcher) -> Result<(), PredictorError> {
    if self.session.get().is_some() {
      return Ok(());
    }

    info!("加载 Mask R-CNN 模型，骨干网络: {}", self.backbone);
    let path = fetcher
      .fetch_to_local_cache(&self.source, MASKRCNN_CACHE_NAME)
      .await?;
    let session =
      tokio::task::spawn_blocking(move || OnnxSession::open(&path, ModelKind::MaskRcnn))
        .await
        .map_err(PredictorError::runtime)??;
    let _ = self.session.set(session);
    info!("Mask R-CNN 模型加载完成");
    Ok(())
  }

  fn infer(&self, image: &RgbImage) -> Result<PredictionBatch, PredictorError> {
    let session = self
      .session
      .get()
      .ok_or(PredictorError::NotLoaded(ModelKind::MaskRcnn))?;

    let start = Instant::now();
    let (width, height) = image.dimensions();
    let input = NchwFrame::from_rgb(image, ChannelOrder::Bgr, 1.0).into_chw();
    let input_value = Value::from_array(input).map_err(PredictorError::runtime)?;

    let items = {
      let mut guard = session.lock()?;
      let outputs = guard
        .run(ort::inputs![session.input_name() => input_value])
        .map_err(PredictorError::runtime)?;

      if outputs.len() < 4 {
        return Err(PredictorError::InvalidOutput(format!(
          "expected 4 outputs, model produced {}",
          outputs.len()
        )));
      }

      let boxes = outputs[0]
        .try_extract_array::<f32>()
        .map_err(PredictorError::runtime)?;
      let classes = outputs[1]
        .try_extract_array::<i64>()
        .map_err(PredictorError::runtime)?;
      let masks = outputs[2]
        .try_extract_array::<f32>()
        .map_err(PredictorError::runtime)?;
      let scores = outputs[3]
        .try_extract_array::<f32>()
        .map_err(PredictorError::runtime)?;
      debug!(
        "Mask R-CNN 输出形状: boxes {:?}, masks {:?}",
        boxes.shape(),
        masks.shape()
      );

      let boxes = boxes
        .into_dimensionality::<Ix2>()
        .map_err(|e| PredictorError::InvalidOutput(format!("boxes: {e}")))?;
      let classes = classes
        .into_dimensionality::<Ix1>()
        .map_err(|e| PredictorError::InvalidOutput(format!("classes: {e}")))?;
      let scores = scores
        .into_dimensionality::<Ix1>()
        .map_err(|e| PredictorError::InvalidOutput(format!("scores: {e}")))?;
      // [N, 1, M, M] => [N, M, M]
      let masks = masks
        .into_dimensionality::<Ix4>()
        .map_err(|e| PredictorError::InvalidOutput(format!("masks: {e}")))?
        .index_axis_move(Axis(1), 0);

      decode_output(
        boxes,
        classes,
        masks,
        scores,
        (height as usize, width as usize),
        &self.options,
      )?
    };

    let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    info!(
      "Mask R-CNN 推理完成，耗时 {:.2}ms，检测到 {} 个椎骨",
      processing_time_ms,
      items.len()
    );

    Ok(PredictionBatch {
      items: items.into_boxed_slice(),
      image_shape: input::image_shape(image),
      processing_time_ms,
      model: ModelKind::MaskRcnn,
    })
  }

  fn describe(&self) -> ModelMetadata {
    self
      .options
      .metadata(ModelKind::MaskRcnn, "Mask R-CNN", &self.backbone, "ONNX Runtime")
  }
}

fn decode_output(
  boxes: ArrayView2<f32>,
  classes: ArrayView1<i64>,
  masks: ArrayView3<f32>,
  scores: ArrayView1<f32>,
  (height, width): (usize, usize),
  options: &InferenceOptions,
) -> Result<Vec<DetectItem>, PredictorError> {
  let count = scores.len();
  if boxes.dim() != (count, 4) || classes.len() != count || masks.len_of(Axis(0)) != count {
    return Err(PredictorError::InvalidOutput(format!(
      "inconsistent instance counts: boxes {:?}, classes {}, masks {:?}, scores {}",
      boxes.shape(),
      classes.len(),
      masks.shape(),
      count
    )));
  }

  let mut items = Vec::new();
  for i in 0..count {
    let score = scores[i];
    if score < options.confidence_threshold {
      continue;
    }

    // 类别表越界由 detection::normalize 统一判定，这里只拒绝负值
    let class_id = usize::try_from(classes[i]).map_err(|_| {
      PredictorError::InvalidOutput(format!("negative class index {}", classes[i]))
    })?;

    let row = boxes.row(i);
    let bbox = [
      row[0].clamp(0.0, width as f32),
      row[1].clamp(0.0, height as f32),
      row[2].clamp(0.0, width as f32),
      row[3].clamp(0.0, height as f32),
    ];

    items.push(DetectItem {
      class_id,
      score,
      bbox,
      mask: paste_mask(masks.slice(s![i, .., ..]), &bbox, height, width),
    });

    if items.len() >= options.max_detections {
      break;
    }
  }

  Ok(items)
}

/// 将框内的固定分辨率掩码贴回原图
fn paste_mask(mask: ArrayView2<f32>, bbox: &[f32; 4], height: usize, width: usize) -> BinaryMask {
  let (mh, mw) = mask.dim();
  // 已是整图掩码时直接二值化
  if (mh, mw) == (height, width) {
    return mask.mapv(|v| u8::from(v > MASKRCNN_MASK_THRESH));
  }

  let mut out = Array2::<u8>::zeros((height, width));
  let [x1, y1, x2, y2] = *bbox;
  let (box_w, box_h) = (x2 - x1, y2 - y1);
  if mh == 0 || mw == 0 || box_w <= 0.0 || box_h <= 0.0 {
    return out;
  }

  let row_start = y1.floor().max(0.0) as usize;
  let row_end = (y2.ceil() as usize).min(height);
  let col_start = x1.floor().max(0.0) as usize;
  let col_end = (x2.ceil() as usize).min(width);

  for y in row_start..row_end {
    let my = (((y as f32 + 0.5 - y1) / box_h) * mh as f32).floor();
    if my < 0.0 || my >= mh as f32 {
      continue;
    }
    for x in col_start..col_end {
      let mx = (((x as f32 + 0.5 - x1) / box_w) * mw as f32).floor();
      if mx < 0.0 || mx >= mw as f32 {
        continue;
      }
      out[[y, x]] = u8::from(mask[[my as usize, mx as usize]] > MASKRCNN_MASK_THRESH);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array1, Array3, array};

  #[test]
  fn test_paste_mask_into_box() {
    let mask = array![[1.0f32, 0.0], [0.0, 1.0]];
    let pasted = paste_mask(mask.view(), &[2.0, 2.0, 6.0, 6.0], 8, 8);
    assert_eq!(pasted.dim(), (8, 8));
    // 左上象限与右下象限为前景
    assert_eq!(pasted[[2, 2]], 1);
    assert_eq!(pasted[[3, 3]], 1);
    assert_eq!(pasted[[5, 5]], 1);
    assert_eq!(pasted[[2, 5]], 0);
    // 框外一律为背景
    assert_eq!(pasted[[0, 0]], 0);
    assert_eq!(pasted[[7, 7]], 0);
    assert_eq!(pasted.iter().map(|&v| v as usize).sum::<usize>(), 8);
  }

  #[test]
  fn test_full_size_mask_thresholded() {
    let mask = array![[0.9f32, 0.1], [0.6, 0.4]];
    let pasted = paste_mask(mask.view(), &[0.0, 0.0, 2.0, 2.0], 2, 2);
    assert_eq!(pasted, array![[1u8, 0], [1, 0]]);
  }

  #[test]
  fn test_decode_filters_and_limits() {
    let boxes = array![[0.0f32, 0.0, 4.0, 4.0], [1.0, 1.0, 3.0, 3.0], [-2.0, 0.0, 9.0, 3.0]];
    let classes = Array1::from(vec![0i64, 5, 16]);
    let scores = Array1::from(vec![0.95f32, 0.3, 0.8]);
    let masks = Array3::<f32>::ones((3, 2, 2));

    let items = decode_output(
      boxes.view(),
      classes.view(),
      masks.view(),
      scores.view(),
      (6, 6),
      &InferenceOptions::default(),
    )
    .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 0);
    assert_eq!(items[1].class_id, 16);
    assert_eq!(items[1].bbox, [0.0, 0.0, 6.0, 3.0]);

    let options = InferenceOptions {
      max_detections: 1,
      ..InferenceOptions::default()
    };
    let items = decode_output(
      boxes.view(),
      classes.view(),
      masks.view(),
      scores.view(),
      (6, 6),
      &options,
    )
    .unwrap();
    assert_eq!(items.len(), 1);
  }

  #[test]
  fn test_class_beyond_table_passes_through() {
    let boxes = array![[0.0f32, 0.0, 4.0, 4.0]];
    let classes = Array1::from(vec![17i64]);
    let scores = Array1::from(vec![0.9f32]);
    let masks = Array3::<f32>::ones((1, 2, 2));
    let items = decode_output(
      boxes.view(),
      classes.view(),
      masks.view(),
      scores.view(),
      (6, 6),
      &InferenceOptions::default(),
    )
    .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 17);
  }

  #[test]
  fn test_negative_class_rejected() {
    let boxes = array![[0.0f32, 0.0, 4.0, 4.0]];
    let classes = Array1::from(vec![-1i64]);
    let scores = Array1::from(vec![0.9f32]);
    let masks = Array3::<f32>::ones((1, 2, 2));
    let result = decode_output(
      boxes.view(),
      classes.view(),
      masks.view(),
      scores.view(),
      (6, 6),
      &InferenceOptions::default(),
    );
    assert!(matches!(result, Err(PredictorError::InvalidOutput(_))));
  }
}
