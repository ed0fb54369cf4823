// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/main.rs - 服务入口
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

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use jizhu::{
  artifact::CachedArtifactFetcher,
  config::Settings,
  model::Predictor,
  registry::ModelRegistry,
  server,
  service::SegmentationService,
};

#[tokio::main]
async fn main() -> Result<()> {
  dotenv::dotenv().ok();
  let settings = Settings::parse();

  tracing_subscriber::fmt()
    .with_max_level(settings.tracing_level())
    .init();

  info!("Jizhu 椎骨分割服务");
  info!("默认模型: {}", settings.default_model);
  info!("模型缓存目录: {}", settings.model_cache_dir.display());
  info!(
    "置信度阈值: {}, NMS 阈值: {}",
    settings.confidence_threshold, settings.nms_threshold
  );

  let fetcher = Arc::new(CachedArtifactFetcher::new(
    &settings.model_cache_dir,
    &settings.aws_region,
    settings.s3_endpoint.clone(),
  ));
  let registry = Arc::new(ModelRegistry::new(
    settings.default_model,
    fetcher,
    predictors(&settings)?,
  ));

  // 启动时加载全部模型，任何失败都直接退出
  info!("正在加载模型...");
  registry.initialize_all().await?;
  info!("模型加载完成");

  let service = Arc::new(SegmentationService::new(
    registry,
    &settings.model_cache_dir,
    settings.confidence_threshold,
  )?);
  let app = server::create_app(service, settings.max_upload_bytes);
  server::serve(app, &settings.bind_address()).await?;

  info!("服务已关闭");
  Ok(())
}

fn predictors(settings: &Settings) -> Result<Vec<Arc<dyn Predictor>>> {
  let mut predictors: Vec<Arc<dyn Predictor>> = Vec::new();

  #[cfg(feature = "model_yolo")]
  predictors.push(Arc::new(jizhu::model::YoloPredictor::new(
    settings.yolo_source()?,
    settings.inference_options(),
    settings.yolo_model_name(),
  )));

  #[cfg(feature = "model_maskrcnn")]
  predictors.push(Arc::new(jizhu::model::MaskRcnnPredictor::new(
    settings.maskrcnn_source()?,
    settings.inference_options(),
    settings.maskrcnn_backbone.clone(),
  )));

  if predictors.is_empty() {
    anyhow::bail!("没有启用任何模型，请开启 model_yolo 或 model_maskrcnn 特性");
  }
  Ok(predictors)
}
