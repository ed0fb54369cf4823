// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/input.rs - 上传图像解码
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

use image::RgbImage;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Invalid image file: {0}")]
  InvalidImage(String),
}

impl From<image::ImageError> for InputError {
  fn from(err: image::ImageError) -> Self {
    InputError::InvalidImage(err.to_string())
  }
}

/// 将上传的字节解码为 RGB 图像，格式由内容自动识别
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, InputError> {
  if bytes.is_empty() {
    return Err(InputError::InvalidImage("no image data".to_string()));
  }

  let image = image::load_from_memory(bytes)?.to_rgb8();
  debug!("解码图像: {}x{}", image.width(), image.height());
  Ok(image)
}

/// [高, 宽, 通道]
pub fn image_shape(image: &RgbImage) -> [usize; 3] {
  [image.height() as usize, image.width() as usize, 3]
}
