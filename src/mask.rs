// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/mask.rs - 二值掩码与 COCO 游程编码
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

//! 二值掩码与 COCO RLE 之间的转换。
//!
//! 掩码按列优先（Fortran 顺序）扫描，游程从 0 的游程开始交替计数，
//! 计数序列再按 pycocotools 的压缩字符串格式序列化。

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 二值掩码，形状为 (高, 宽)，取值 0 或 1
pub type BinaryMask = Array2<u8>;

// 压缩字符串中每个字符携带 5 位数据
const RLE_CHAR_OFFSET: u8 = 48;
const RLE_DATA_MASK: i64 = 0x1f;
const RLE_SIGN_BIT: i64 = 0x10;
const RLE_MORE_BIT: i64 = 0x20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskCodecError {
  #[error("malformed RLE: invalid character {0:?} at offset {1}")]
  InvalidCharacter(char, usize),
  #[error("malformed RLE: counts string ends inside a value")]
  Truncated,
  #[error("malformed RLE: negative run length {0}")]
  NegativeRun(i64),
  #[error("malformed RLE: run length {0} exceeds the 32-bit range")]
  RunOverflow(i64),
  #[error("malformed RLE: runs cover {actual} pixels, size {height}x{width} needs {expected}")]
  LengthMismatch {
    height: usize,
    width: usize,
    expected: u64,
    actual: u64,
  },
}

/// COCO 格式的游程编码掩码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rle {
  /// [高, 宽]
  pub size: [usize; 2],
  /// 压缩后的游程字符串
  pub counts: String,
}

impl Rle {
  pub fn height(&self) -> usize {
    self.size[0]
  }

  pub fn width(&self) -> usize {
    self.size[1]
  }

  /// 前景像素数量（所有奇数位游程之和）
  pub fn area(&self) -> Result<u64, MaskCodecError> {
    let counts = counts_from_string(&self.counts)?;
    Ok(counts.iter().skip(1).step_by(2).map(|&c| c as u64).sum())
  }
}

/// 将二值掩码编码为 RLE，任何非零值都视为前景
pub fn encode(mask: &BinaryMask) -> Rle {
  let (height, width) = mask.dim();

  // 转置视图的逻辑顺序即原掩码的列优先顺序
  let mut counts = Vec::new();
  let mut current = 0u8;
  let mut run = 0u32;
  for &value in mask.t().iter() {
    let value = u8::from(value != 0);
    if value != current {
      counts.push(run);
      run = 0;
      current = value;
    }
    run += 1;
  }
  counts.push(run);

  Rle {
    size: [height, width],
    counts: counts_to_string(&counts),
  }
}

/// 将 RLE 解码为二值掩码
pub fn decode(rle: &Rle) -> Result<BinaryMask, MaskCodecError> {
  let (height, width) = (rle.height(), rle.width());
  let counts = counts_from_string(&rle.counts)?;

  let expected = height as u64 * width as u64;
  let actual: u64 = counts.iter().map(|&c| c as u64).sum();
  if actual != expected {
    return Err(MaskCodecError::LengthMismatch {
      height,
      width,
      expected,
      actual,
    });
  }

  let mut flat = Vec::with_capacity(expected as usize);
  let mut value = 0u8;
  for &count in &counts {
    flat.extend(std::iter::repeat_n(value, count as usize));
    value ^= 1;
  }

  // 数据为列优先，先按 (宽, 高) 构造再转置回 (高, 宽)
  let transposed = Array2::from_shape_vec((width, height), flat).map_err(|_| {
    MaskCodecError::LengthMismatch {
      height,
      width,
      expected,
      actual,
    }
  })?;
  Ok(transposed.reversed_axes().as_standard_layout().into_owned())
}

/// 按 pycocotools 的 `rleToString` 规则序列化游程
pub fn counts_to_string(counts: &[u32]) -> String {
  let mut out = String::with_capacity(counts.len() * 2);
  for (i, &count) in counts.iter().enumerate() {
    let mut x = count as i64;
    if i > 2 {
      x -= counts[i - 2] as i64;
    }
    loop {
      let mut c = x & RLE_DATA_MASK;
      x >>= 5;
      let more = if c & RLE_SIGN_BIT != 0 { x != -1 } else { x != 0 };
      if more {
        c |= RLE_MORE_BIT;
      }
      out.push((c as u8 + RLE_CHAR_OFFSET) as char);
      if !more {
        break;
      }
    }
  }
  out
}

/// 按 pycocotools 的 `rleFrString` 规则解析游程
pub fn counts_from_string(s: &str) -> Result<Vec<u32>, MaskCodecError> {
  let bytes = s.as_bytes();
  let mut counts: Vec<u32> = Vec::with_capacity(bytes.len());
  let mut p = 0usize;

  while p < bytes.len() {
    let mut x = 0i64;
    let mut k = 0u32;
    loop {
      let Some(&byte) = bytes.get(p) else {
        return Err(MaskCodecError::Truncated);
      };
      let c = match byte.checked_sub(RLE_CHAR_OFFSET) {
        Some(c) if c < 64 => c as i64,
        _ => return Err(MaskCodecError::InvalidCharacter(byte as char, p)),
      };
      // 超过 64 位的值不可能是合法游程
      if k >= 12 {
        return Err(MaskCodecError::InvalidCharacter(byte as char, p));
      }
      x |= (c & RLE_DATA_MASK) << (5 * k);
      p += 1;
      k += 1;
      if c & RLE_MORE_BIT == 0 {
        if c & RLE_SIGN_BIT != 0 {
          x |= -1i64 << (5 * k);
        }
        break;
      }
    }

    let m = counts.len();
    if m > 2 {
      x += counts[m - 2] as i64;
    }
    let count = match u32::try_from(x) {
      Ok(count) => count,
      Err(_) if x < 0 => return Err(MaskCodecError::NegativeRun(x)),
      Err(_) => return Err(MaskCodecError::RunOverflow(x)),
    };
    counts.push(count);
  }

  Ok(counts)
}

/// 最近邻缩放到目标尺寸，尺寸相同时直接复制
pub fn resize_nearest(mask: &BinaryMask, height: usize, width: usize) -> BinaryMask {
  let (src_h, src_w) = mask.dim();
  if (src_h, src_w) == (height, width) {
    return mask.clone();
  }
  if src_h == 0 || src_w == 0 {
    return Array2::zeros((height, width));
  }

  Array2::from_shape_fn((height, width), |(y, x)| {
    let sy = (y * src_h / height).min(src_h - 1);
    let sx = (x * src_w / width).min(src_w - 1);
    mask[[sy, sx]]
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  fn checkerboard(h: usize, w: usize) -> BinaryMask {
    Array2::from_shape_fn((h, w), |(y, x)| ((x + y) % 2) as u8)
  }

  #[test]
  fn test_center_pixel_known_vector() {
    let mask = array![[0u8, 0, 0], [0, 1, 0], [0, 0, 0]];
    let rle = encode(&mask);
    assert_eq!(rle.size, [3, 3]);
    assert_eq!(rle.counts, "414");
    assert_eq!(decode(&rle).unwrap(), mask);
  }

  #[test]
  fn test_column_major_scan() {
    // 第一列全为 1：列优先下是开头的一段连续前景
    let mask = array![[1u8, 0], [1, 0], [1, 0]];
    let counts = counts_from_string(&encode(&mask).counts).unwrap();
    assert_eq!(counts, vec![0, 3, 3]);
  }

  #[test]
  fn test_negative_delta_and_continuation() {
    assert_eq!(counts_to_string(&[10, 2, 5, 1]), ":25O");
    assert_eq!(counts_from_string(":25O").unwrap(), vec![10, 2, 5, 1]);
    assert_eq!(counts_to_string(&[100]), "T3");
    assert_eq!(counts_from_string("T3").unwrap(), vec![100]);
  }

  #[test]
  fn test_round_trip_shapes() {
    let masks = vec![
      Array2::<u8>::zeros((7, 5)),
      Array2::<u8>::ones((4, 9)),
      checkerboard(6, 6),
      checkerboard(1, 13),
      Array2::from_shape_fn((64, 48), |(y, x)| u8::from(y > 10 && y < 40 && x > 5 && x < 30)),
    ];
    for mask in masks {
      let rle = encode(&mask);
      assert_eq!(decode(&rle).unwrap(), mask, "round trip failed for {:?}", rle);
    }
  }

  #[test]
  fn test_all_zero_and_all_one() {
    let zeros = Array2::<u8>::zeros((512, 512));
    let rle = encode(&zeros);
    assert_eq!(counts_from_string(&rle.counts).unwrap(), vec![512 * 512]);
    assert_eq!(rle.area().unwrap(), 0);

    let ones = Array2::<u8>::ones((512, 512));
    let rle = encode(&ones);
    assert_eq!(counts_from_string(&rle.counts).unwrap(), vec![0, 512 * 512]);
    assert_eq!(rle.area().unwrap(), 512 * 512);
    assert_eq!(decode(&rle).unwrap(), ones);
  }

  #[test]
  fn test_nonzero_values_are_foreground() {
    let mask = array![[0u8, 255], [7, 0]];
    let decoded = decode(&encode(&mask)).unwrap();
    assert_eq!(decoded, array![[0u8, 1], [1, 0]]);
  }

  #[test]
  fn test_malformed_inputs() {
    let bad_char = Rle {
      size: [2, 2],
      counts: "4 ".to_string(),
    };
    assert!(matches!(
      decode(&bad_char),
      Err(MaskCodecError::InvalidCharacter(' ', 1))
    ));

    // 'T' 带有续位标记，但后面没有字符
    assert_eq!(counts_from_string("T"), Err(MaskCodecError::Truncated));

    let wrong_total = Rle {
      size: [3, 3],
      counts: "41".to_string(),
    };
    assert!(matches!(
      decode(&wrong_total),
      Err(MaskCodecError::LengthMismatch { expected: 9, actual: 5, .. })
    ));
  }

  #[test]
  fn test_negative_run_rejected() {
    // 第四个值的增量为 -5，而两位之前的游程只有 2
    let counts = counts_to_string(&[1, 2, 3, 0]);
    let mut chars: Vec<char> = counts.chars().collect();
    let last = chars.len() - 1;
    chars[last] = 'K'; // 27 => -5
    let tampered: String = chars.into_iter().collect();
    assert!(matches!(
      counts_from_string(&tampered),
      Err(MaskCodecError::NegativeRun(-3))
    ));
  }

  #[test]
  fn test_oversized_run_rejected() {
    // 六个带续位的 0 组，最后一组为 8 => 2^33
    assert_eq!(
      counts_from_string("PPPPPP8"),
      Err(MaskCodecError::RunOverflow(1i64 << 33))
    );
  }

  #[test]
  fn test_resize_nearest() {
    let mask = array![[1u8, 0], [0, 1]];
    let resized = resize_nearest(&mask, 4, 4);
    assert_eq!(
      resized,
      array![[1u8, 1, 0, 0], [1, 1, 0, 0], [0, 0, 1, 1], [0, 0, 1, 1]]
    );
    assert_eq!(resize_nearest(&mask, 2, 2), mask);
  }
}
