// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/output/draw.rs - 分割结果可视化
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

use std::collections::{BTreeMap, BTreeSet};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
  mask::{BinaryMask, resize_nearest},
  output::OutputError,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 4;
const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]); // 白色文本

// 固定种子，保证同一标签在每次请求中颜色一致
const PALETTE_SEED: u64 = 42;

pub const MASK_BLEND_ORIGINAL: f32 = 0.7;
pub const MASK_BLEND_COLOR: f32 = 0.3;

/// 一个待绘制的实例
#[derive(Debug, Clone, Copy)]
pub struct Annotation<'a> {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，像素坐标
  pub mask: &'a BinaryMask,
  pub score: f32,
  pub label: &'a str,
}

pub struct Draw {
  font_size: f32,
  label_padding: i32,
  font: FontArc,
}

impl Draw {
  pub fn new() -> Result<Self, OutputError> {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    let font = FontArc::try_from_slice(font_data)?;

    Ok(Self {
      font_size: LABEL_FONT_SIZE,
      label_padding: LABEL_PADDING,
      font,
    })
  }

  /// 在图像副本上绘制掩码、边框与标签，低于阈值的实例直接跳过
  pub fn render(
    &self,
    image: &RgbImage,
    annotations: &[Annotation<'_>],
    score_threshold: f32,
  ) -> RgbImage {
    let mut canvas = image.clone();
    if canvas.width() == 0 || canvas.height() == 0 {
      return canvas;
    }

    // 颜色按全部标签分配，与阈值无关
    let colors = palette(annotations.iter().map(|a| a.label));

    for annotation in annotations
      .iter()
      .filter(|a| a.score >= score_threshold)
    {
      let color = colors
        .get(annotation.label)
        .copied()
        .unwrap_or(TEXT_COLOR);
      blend_mask(&mut canvas, annotation.mask, color);
      self.draw_bbox_with_label(
        &mut canvas,
        &annotation.bbox,
        annotation.label,
        annotation.score,
        color,
      );
    }

    canvas
  }

  // 在图像上绘制一个矩形边框，bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(
    &self,
    image: &mut RgbImage,
    bbox: &[f32; 4],
    label: &str,
    score: f32,
    color: Rgb<u8>,
  ) {
    let (w, h) = (image.width() as i32, image.height() as i32);

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    // 绘制边框（加粗为2像素）
    for thickness in 0..BOX_THICKNESS {
      let x_min_t = (x_min + thickness).min(w - 1);
      let y_min_t = (y_min + thickness).min(h - 1);
      let x_max_t = (x_max - thickness).max(0);
      let y_max_t = (y_max - thickness).max(0);

      for x in x_min_t..=x_max_t {
        image.put_pixel(x as u32, y_min_t as u32, color);
        image.put_pixel(x as u32, y_max_t as u32, color);
      }
      for y in y_min_t..=y_max_t {
        image.put_pixel(x_min_t as u32, y as u32, color);
        image.put_pixel(x_max_t as u32, y as u32, color);
      }
    }

    let text = format!("{}: {:.2}", label, score);
    let scale = PxScale::from(self.font_size);
    let (text_width, text_height) = text_size(scale, &self.font, &text);

    // 标签背景位于边框上方，贴近顶部时下移到图像内
    let label_height = text_height as i32 + self.label_padding * 2;
    let label_x = x_min;
    let label_y = (y_min - label_height).max(0);
    let label_width = (text_width as i32 + self.label_padding).min(w - label_x);

    if label_width > 0 && label_height > 0 {
      let rect = imageproc::rect::Rect::at(label_x, label_y)
        .of_size(label_width as u32, label_height as u32);
      draw_filled_rect_mut(image, rect, color);

      draw_text_mut(
        image,
        TEXT_COLOR,
        label_x + self.label_padding / 2,
        label_y + self.label_padding,
        scale,
        &self.font,
        &text,
      );
    }
  }
}

/// 为每个不同的标签生成颜色，标签先排序再依次取随机数
pub fn palette<'a>(labels: impl Iterator<Item = &'a str>) -> BTreeMap<&'a str, Rgb<u8>> {
  let distinct: BTreeSet<&str> = labels.collect();
  let mut rng = StdRng::seed_from_u64(PALETTE_SEED);
  distinct
    .into_iter()
    .map(|label| {
      let color = Rgb([
        rng.gen_range(0..255),
        rng.gen_range(0..255),
        rng.gen_range(0..255),
      ]);
      (label, color)
    })
    .collect()
}

fn blend_pixel(pixel: &mut Rgb<u8>, color: Rgb<u8>) {
  for c in 0..3 {
    let value = pixel[c] as f32 * MASK_BLEND_ORIGINAL + color[c] as f32 * MASK_BLEND_COLOR;
    pixel[c] = value.round().clamp(0.0, 255.0) as u8;
  }
}

fn blend_mask(image: &mut RgbImage, mask: &BinaryMask, color: Rgb<u8>) {
  let (w, h) = (image.width() as usize, image.height() as usize);
  let resized;
  let mask = if mask.dim() == (h, w) {
    mask
  } else {
    resized = resize_nearest(mask, h, w);
    &resized
  };

  for ((y, x), &value) in mask.indexed_iter() {
    if value != 0 {
      blend_pixel(image.get_pixel_mut(x as u32, y as u32), color);
    }
  }
}
