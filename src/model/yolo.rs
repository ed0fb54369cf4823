// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/model/yolo.rs - YOLOv8 分割模型
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
use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis, Ix3, Ix4};
use ort::value::Value;
use tracing::{debug, info};

use crate::{
  artifact::{ArtifactFetcher, ArtifactSource},
  frame::{ChannelOrder, NchwFrame},
  input,
  mask::BinaryMask,
  model::{
    DetectItem, InferenceOptions, ModelKind, ModelMetadata, PredictionBatch, Predictor,
    PredictorError, VERTEBRA_CLASSES,
    onnx::{OnnxSession, iou, sigmoid},
  },
};

const YOLO_INPUT_W: u32 = 640;
const YOLO_INPUT_H: u32 = 640;
const YOLO_BOX_DIMS: usize = 4;
const YOLO_MASK_THRESH: f32 = 0.5;
const YOLO_CACHE_NAME: &str = "yolo_model.onnx";

/// YOLOv8-seg 导出的 ONNX 模型
///
/// 输出 0 为 `[1, 4 + 类别数 + 掩码系数, 锚点数]`，
/// 输出 1 为掩码原型 `[1, 掩码系数, mh, mw]`。
pub struct YoloPredictor {
  source: ArtifactSource,
  options: InferenceOptions,
  model_name: String,
  session: OnceLock<OnnxSession>,
}

impl YoloPredictor {
  pub fn new(
    source: ArtifactSource,
    options: InferenceOptions,
    model_name: impl Into<String>,
  ) -> Self {
    Self {
      source,
      options,
      model_name: model_name.into(),
      session: OnceLock::new(),
    }
  }
}

#[async_trait]
impl Predictor for YoloPredictor {
  fn kind(&self) -> ModelKind {
    ModelKind::Yolo
  }

  async fn load(&self, fetcher: &dyn ArtifactFetcher) -> Result<(), PredictorError> {
    if self.session.get().is_some() {
      return Ok(());
    }

    info!("加载 YOLOv8 分割模型");
    let path = fetcher
      .fetch_to_local_cache(&self.source, YOLO_CACHE_NAME)
      .await?;
    let session = tokio::task::spawn_blocking(move || OnnxSession::open(&path, ModelKind::Yolo))
      .await
      .map_err(PredictorError::runtime)??;
    let _ = self.session.set(session);
    info!("YOLOv8 模型加载完成");
    Ok(())
  }

  fn infer(&self, image: &RgbImage) -> Result<PredictionBatch, PredictorError> {
    let session = self
      .session
      .get()
      .ok_or(PredictorError::NotLoaded(ModelKind::Yolo))?;

    let start = Instant::now();
    let (width, height) = image.dimensions();
    let input = NchwFrame::resized(
      image,
      YOLO_INPUT_W,
      YOLO_INPUT_H,
      ChannelOrder::Rgb,
      1.0 / 255.0,
    )
    .into_nchw();
    let input_value = Value::from_array(input).map_err(PredictorError::runtime)?;

    let items = {
      let mut guard = session.lock()?;
      let outputs = guard
        .run(ort::inputs![session.input_name() => input_value])
        .map_err(PredictorError::runtime)?;

      if outputs.len() < 2 {
        return Err(PredictorError::InvalidOutput(format!(
          "expected 2 outputs, model produced {}",
          outputs.len()
        )));
      }

      let preds = outputs[0]
        .try_extract_array::<f32>()
        .map_err(PredictorError::runtime)?;
      let protos = outputs[1]
        .try_extract_array::<f32>()
        .map_err(PredictorError::runtime)?;
      debug!("YOLO 输出形状: {:?} / {:?}", preds.shape(), protos.shape());

      let preds = preds
        .into_dimensionality::<Ix3>()
        .map_err(|e| PredictorError::InvalidOutput(format!("detection head: {e}")))?;
      let protos = protos
        .into_dimensionality::<Ix4>()
        .map_err(|e| PredictorError::InvalidOutput(format!("mask prototypes: {e}")))?;
      if preds.len_of(Axis(0)) == 0 || protos.len_of(Axis(0)) == 0 {
        return Err(PredictorError::InvalidOutput("empty batch dimension".to_string()));
      }
      let preds = preds.index_axis_move(Axis(0), 0);
      let protos = protos.index_axis_move(Axis(0), 0);

      decode_output(preds, protos, width, height, &self.options)?
    };

    let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    info!(
      "YOLOv8 推理完成，耗时 {:.2}ms，检测到 {} 个椎骨",
      processing_time_ms,
      items.len()
    );

    Ok(PredictionBatch {
      items: items.into_boxed_slice(),
      image_shape: input::image_shape(image),
      processing_time_ms,
      model: ModelKind::Yolo,
    })
  }

  fn describe(&self) -> ModelMetadata {
    self
      .options
      .metadata(ModelKind::Yolo, &self.model_name, "YOLOv8", "ONNX Runtime")
  }
}

struct Candidate {
  class_id: usize,
  score: f32,
  bbox: [f32; 4],
  coeffs: Array1<f32>,
}

/// 解码检测头与掩码原型，坐标与掩码均还原到原图尺寸
fn decode_output(
  preds: ArrayView2<f32>,
  protos: ArrayView3<f32>,
  image_width: u32,
  image_height: u32,
  options: &InferenceOptions,
) -> Result<Vec<DetectItem>, PredictorError> {
  let num_classes = VERTEBRA_CLASSES.len();
  let (num_coeffs, proto_h, proto_w) = protos.dim();
  let expected_rows = YOLO_BOX_DIMS + num_classes + num_coeffs;
  if preds.nrows() != expected_rows {
    return Err(PredictorError::InvalidOutput(format!(
      "detection head has {} rows, expected {}",
      preds.nrows(),
      expected_rows
    )));
  }

  let mut candidates = Vec::new();
  for anchor in preds.axis_iter(Axis(1)) {
    let (class_id, score) = anchor
      .slice(ndarray::s![YOLO_BOX_DIMS..YOLO_BOX_DIMS + num_classes])
      .iter()
      .copied()
      .enumerate()
      .fold((0usize, f32::MIN), |best, (c, s)| {
        if s > best.1 { (c, s) } else { best }
      });

    if score < options.confidence_threshold {
      continue;
    }

    let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
    candidates.push(Candidate {
      class_id,
      score,
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
      coeffs: anchor
        .slice(ndarray::s![YOLO_BOX_DIMS + num_classes..])
        .to_owned(),
    });
  }

  let mut kept = nms(candidates, options.nms_threshold);
  kept.truncate(options.max_detections);
  debug!("NMS 之后保留 {} 个候选", kept.len());

  let protos = protos
    .into_shape_with_order((num_coeffs, proto_h * proto_w))
    .map_err(|e| PredictorError::InvalidOutput(format!("mask prototypes: {e}")))?;

  let scale_x = image_width as f32 / YOLO_INPUT_W as f32;
  let scale_y = image_height as f32 / YOLO_INPUT_H as f32;

  Ok(
    kept
      .into_iter()
      .map(|candidate| {
        let logits = candidate.coeffs.dot(&protos);
        let mask = crop_and_upsample(
          &logits,
          (proto_h, proto_w),
          &candidate.bbox,
          (image_height as usize, image_width as usize),
        );
        let [x1, y1, x2, y2] = candidate.bbox;
        DetectItem {
          class_id: candidate.class_id,
          score: candidate.score,
          bbox: [
            (x1 * scale_x).clamp(0.0, image_width as f32),
            (y1 * scale_y).clamp(0.0, image_height as f32),
            (x2 * scale_x).clamp(0.0, image_width as f32),
            (y2 * scale_y).clamp(0.0, image_height as f32),
          ],
          mask,
        }
      })
      .collect(),
  )
}

/// 非极大值抑制，仅在同类别之间进行
fn nms(mut candidates: Vec<Candidate>, nms_threshold: f32) -> Vec<Candidate> {
  // 按置信度降序排序
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result: Vec<Candidate> = Vec::new();
  for candidate in candidates {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == candidate.class_id && iou(&kept.bbox, &candidate.bbox) >= nms_threshold);
    if !suppressed {
      result.push(candidate);
    }
  }
  result
}

/// 原型分辨率的掩码 logits 裁剪到框内，再以最近邻放大到原图
fn crop_and_upsample(
  logits: &Array1<f32>,
  (proto_h, proto_w): (usize, usize),
  bbox: &[f32; 4],
  (out_h, out_w): (usize, usize),
) -> BinaryMask {
  let sx = proto_w as f32 / YOLO_INPUT_W as f32;
  let sy = proto_h as f32 / YOLO_INPUT_H as f32;
  let (bx1, by1, bx2, by2) = (bbox[0] * sx, bbox[1] * sy, bbox[2] * sx, bbox[3] * sy);

  let proto_mask = Array2::from_shape_fn((proto_h, proto_w), |(y, x)| {
    let (fx, fy) = (x as f32, y as f32);
    let inside = fx >= bx1 && fx < bx2 && fy >= by1 && fy < by2;
    u8::from(inside && sigmoid(logits[y * proto_w + x]) > YOLO_MASK_THRESH)
  });

  crate::mask::resize_nearest(&proto_mask, out_h, out_w)
}
