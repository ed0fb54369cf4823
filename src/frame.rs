// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/frame.rs - NCHW 帧定义
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

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array3, Array4, Axis};

const RGB_CHANNELS: usize = 3;

/// 通道顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
  Rgb,
  Bgr,
}

/// 平面排布（NCHW 去掉 N）的浮点帧
#[derive(Debug, Clone)]
pub struct NchwFrame {
  data: Array3<f32>,
}

impl NchwFrame {
  /// 从 RGB 图像构造，`scale` 作用于每个像素值
  pub fn from_rgb(image: &RgbImage, order: ChannelOrder, scale: f32) -> Self {
    let (width, height) = image.dimensions();
    let mut data = Array3::<f32>::zeros((RGB_CHANNELS, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
      for c in 0..RGB_CHANNELS {
        let src = match order {
          ChannelOrder::Rgb => c,
          ChannelOrder::Bgr => RGB_CHANNELS - 1 - c,
        };
        data[[c, y as usize, x as usize]] = pixel[src] as f32 * scale;
      }
    }

    Self { data }
  }

  /// 先缩放到模型输入尺寸再构造
  pub fn resized(
    image: &RgbImage,
    width: u32,
    height: u32,
    order: ChannelOrder,
    scale: f32,
  ) -> Self {
    if image.dimensions() == (width, height) {
      return Self::from_rgb(image, order, scale);
    }
    let resized = image::imageops::resize(image, width, height, FilterType::Triangle);
    Self::from_rgb(&resized, order, scale)
  }

  /// [C, H, W]
  pub fn into_chw(self) -> Array3<f32> {
    self.data
  }

  /// [1, C, H, W]
  pub fn into_nchw(self) -> Array4<f32> {
    self.data.insert_axis(Axis(0))
  }
}
