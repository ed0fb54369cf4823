// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/detection.rs - 检测结果的统一表示
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  mask::{self, Rle},
  model::PredictionBatch,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
  #[error("class index {index} out of range for a table of {len} classes")]
  ClassIndexOutOfRange { index: usize, len: usize },
}

/// 像素坐标下的边界框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

/// 单个椎骨的检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub bbox: BoundingBox,
  pub mask: Rle,
  pub score: f32,
  pub class_name: String,
  pub class_id: usize,
}

/// 按索引查找类别名
pub fn class_name<'a>(classes: &[&'a str], index: usize) -> Result<&'a str, NormalizeError> {
  classes
    .get(index)
    .copied()
    .ok_or(NormalizeError::ClassIndexOutOfRange {
      index,
      len: classes.len(),
    })
}

/// 将后端的原始输出转换为统一的检测列表
///
/// 先校验全部类别索引，任何一个越界都不会产生部分结果；
/// 坐标下限截断到 0，顺序与输入保持一致。
pub fn normalize(batch: &PredictionBatch, classes: &[&str]) -> Result<Vec<Detection>, NormalizeError> {
  let names = batch
    .items
    .iter()
    .map(|item| class_name(classes, item.class_id))
    .collect::<Result<Vec<_>, _>>()?;

  Ok(
    batch
      .items
      .iter()
      .zip(names)
      .map(|(item, name)| {
        let [x1, y1, x2, y2] = item.bbox;
        Detection {
          bbox: BoundingBox {
            x1: x1.max(0.0),
            y1: y1.max(0.0),
            x2: x2.max(0.0),
            y2: y2.max(0.0),
          },
          mask: mask::encode(&item.mask),
          score: item.score,
          class_name: name.to_string(),
          class_id: item.class_id,
        }
      })
      .collect(),
  )
}
