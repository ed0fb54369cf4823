// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/config.rs - 服务配置
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

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;
use url::Url;

use crate::{
  artifact::{ArtifactError, ArtifactSource},
  model::{InferenceOptions, ModelKind},
};

/// 每个配置项都可以通过命令行参数或同名的大写环境变量设置，
/// 启动时还会读取当前目录下的 `.env`。
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
  /// AWS 区域
  #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
  pub aws_region: String,

  /// 存放模型权重的 S3 桶
  #[arg(long, env = "S3_BUCKET", default_value = "vertebrae-artifacts")]
  pub s3_bucket: String,

  /// 兼容 S3 的自定义端点（例如 MinIO），为空时使用 AWS 区域端点
  #[arg(long, env = "S3_ENDPOINT", value_name = "URL")]
  pub s3_endpoint: Option<Url>,

  /// 模型缓存目录
  #[arg(long, env = "MODEL_CACHE_DIR", default_value = "/tmp/model_cache", value_name = "DIR")]
  pub model_cache_dir: PathBuf,

  /// 默认模型（yolo 或 maskrcnn）
  #[arg(long, env = "DEFAULT_MODEL", default_value = "yolo")]
  pub default_model: ModelKind,

  /// YOLO 权重的位置：桶内对象键，或 s3:// / https:// / file:// URL
  #[arg(long, env = "YOLO_MODEL_KEY", default_value = "yolo_best.onnx")]
  pub yolo_model_key: String,

  /// Mask R-CNN 权重的位置，格式同上
  #[arg(long, env = "MASKRCNN_MODEL_KEY", default_value = "model_final.onnx")]
  pub maskrcnn_model_key: String,

  /// Mask R-CNN 骨干网络配置名，仅用于模型描述
  #[arg(
    long,
    env = "MASKRCNN_BACKBONE",
    default_value = "COCO-InstanceSegmentation/mask_rcnn_R_50_FPN_3x.yaml"
  )]
  pub maskrcnn_backbone: String,

  /// 监听地址
  #[arg(long, env = "API_HOST", default_value = "0.0.0.0")]
  pub api_host: String,

  /// 监听端口
  #[arg(long, env = "API_PORT", default_value = "8000")]
  pub api_port: u16,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, env = "CONFIDENCE_THRESHOLD", default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence_threshold: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, env = "NMS_THRESHOLD", default_value = "0.5", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 每张图像的最大检测数
  #[arg(long, env = "MAX_DETECTIONS", default_value = "100", value_name = "COUNT")]
  pub max_detections: usize,

  /// 推理设备，目前仅支持 cpu
  #[arg(long, env = "DEVICE", default_value = "cpu")]
  pub device: String,

  /// 日志级别（TRACE、DEBUG、INFO、WARNING、ERROR）
  #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
  pub log_level: String,

  /// 上传文件大小上限（字节）
  #[arg(long, env = "MAX_UPLOAD_BYTES", default_value = "20971520", value_name = "BYTES")]
  pub max_upload_bytes: usize,
}

impl Settings {
  pub fn inference_options(&self) -> InferenceOptions {
    InferenceOptions {
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      max_detections: self.max_detections,
      device: self.device.clone(),
    }
  }

  pub fn yolo_source(&self) -> Result<ArtifactSource, ArtifactError> {
    ArtifactSource::resolve(&self.yolo_model_key, &self.s3_bucket)
  }

  pub fn maskrcnn_source(&self) -> Result<ArtifactSource, ArtifactError> {
    ArtifactSource::resolve(&self.maskrcnn_model_key, &self.s3_bucket)
  }

  /// 权重名中带 `m` 时视为 medium 变体
  pub fn yolo_model_name(&self) -> &'static str {
    if self.yolo_model_key.contains('m') {
      "YOLOv8m-seg"
    } else {
      "YOLOv8-seg"
    }
  }

  /// 日志级别，兼容 Python 风格的 WARNING / CRITICAL
  pub fn tracing_level(&self) -> Level {
    match self.log_level.to_ascii_uppercase().as_str() {
      "WARNING" => Level::WARN,
      "CRITICAL" | "FATAL" => Level::ERROR,
      other => other.parse().unwrap_or(Level::INFO),
    }
  }

  pub fn bind_address(&self) -> String {
    format!("{}:{}", self.api_host, self.api_port)
  }
}
