// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/registry.rs - 模型注册表
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

//! 按模型标识选择已就绪的预测器。
//!
//! 全部模型只初始化一次：并发的首次调用共享同一次加载，
//! 加载结果（成功或第一个失败）被记住，之后不会重试。

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::{
  artifact::ArtifactFetcher,
  model::{ModelKind, ModelMetadata, Predictor},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
  #[error("Unknown model type: {0}. Supported types: yolo, maskrcnn")]
  UnknownModelType(String),
  #[error("Model '{model}' is not ready: {reason}")]
  ModelNotReady { model: ModelKind, reason: String },
  #[error("Failed to load model '{model}': {reason}")]
  LoadFailed { model: ModelKind, reason: String },
}

/// 单个模型的加载状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
  Uninitialized,
  Initializing,
  Ready,
  FailedToLoad(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoadFailure {
  model: ModelKind,
  reason: String,
}

struct Entry {
  predictor: Arc<dyn Predictor>,
  state: RwLock<LoadState>,
}

impl Entry {
  fn state(&self) -> LoadState {
    match self.state.read() {
      Ok(state) => state.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  fn set_state(&self, state: LoadState) {
    match self.state.write() {
      Ok(mut guard) => *guard = state,
      Err(poisoned) => *poisoned.into_inner() = state,
    }
  }
}

pub struct ModelRegistry {
  default_model: ModelKind,
  fetcher: Arc<dyn ArtifactFetcher>,
  entries: Vec<(ModelKind, Entry)>,
  init: OnceCell<Result<(), LoadFailure>>,
}

impl ModelRegistry {
  /// 按给定顺序注册预测器，同一类型重复注册时保留第一个
  pub fn new(
    default_model: ModelKind,
    fetcher: Arc<dyn ArtifactFetcher>,
    predictors: Vec<Arc<dyn Predictor>>,
  ) -> Self {
    let mut entries: Vec<(ModelKind, Entry)> = Vec::with_capacity(predictors.len());
    for predictor in predictors {
      let kind = predictor.kind();
      if entries.iter().any(|(k, _)| *k == kind) {
        warn!("模型 {} 重复注册，忽略", kind);
        continue;
      }
      entries.push((
        kind,
        Entry {
          predictor,
          state: RwLock::new(LoadState::Uninitialized),
        },
      ));
    }

    Self {
      default_model,
      fetcher,
      entries,
      init: OnceCell::new(),
    }
  }

  pub fn default_model(&self) -> ModelKind {
    self.default_model
  }

  pub fn registered(&self) -> impl Iterator<Item = ModelKind> + '_ {
    self.entries.iter().map(|(kind, _)| *kind)
  }

  pub fn state(&self, kind: ModelKind) -> Option<LoadState> {
    self.entry(kind).map(Entry::state)
  }

  /// 初始化成功且所有模型都已就绪
  pub fn is_ready(&self) -> bool {
    matches!(self.init.get(), Some(Ok(())))
      && self
        .entries
        .iter()
        .all(|(_, entry)| entry.state() == LoadState::Ready)
  }

  /// 加载全部模型，多次调用只会真正执行一次
  pub async fn initialize_all(&self) -> Result<(), RegistryError> {
    self
      .init
      .get_or_init(|| self.load_all())
      .await
      .clone()
      .map_err(|failure| RegistryError::LoadFailed {
        model: failure.model,
        reason: failure.reason,
      })
  }

  async fn load_all(&self) -> Result<(), LoadFailure> {
    for (kind, entry) in &self.entries {
      entry.set_state(LoadState::Initializing);
      info!("初始化模型: {}", kind);

      if let Err(e) = entry.predictor.load(self.fetcher.as_ref()).await {
        let reason = e.to_string();
        error!("模型 {} 加载失败: {}", kind, reason);
        entry.set_state(LoadState::FailedToLoad(reason.clone()));
        return Err(LoadFailure {
          model: *kind,
          reason,
        });
      }

      entry.set_state(LoadState::Ready);
      info!("模型 {} 已就绪", kind);
    }
    Ok(())
  }

  /// 按标识取得就绪的预测器，`None` 表示默认模型
  pub async fn resolve(&self, id: Option<&str>) -> Result<Arc<dyn Predictor>, RegistryError> {
    let kind = match id {
      None => self.default_model,
      Some(id) => id
        .parse::<ModelKind>()
        .map_err(|e| RegistryError::UnknownModelType(e.0))?,
    };
    let entry = self
      .entry(kind)
      .ok_or_else(|| RegistryError::UnknownModelType(kind.to_string()))?;

    if let Err(e) = self.initialize_all().await {
      return Err(RegistryError::ModelNotReady {
        model: kind,
        reason: e.to_string(),
      });
    }

    match entry.state() {
      LoadState::Ready => Ok(entry.predictor.clone()),
      state => Err(RegistryError::ModelNotReady {
        model: kind,
        reason: format!("model is in state {state:?}"),
      }),
    }
  }

  /// 单个模型的描述信息
  pub async fn model_info(&self, id: Option<&str>) -> Result<ModelMetadata, RegistryError> {
    self.resolve(id).await.map(|predictor| predictor.describe())
  }

  /// 所有已就绪模型的描述信息，按注册顺序
  pub fn describe_all(&self) -> Vec<ModelMetadata> {
    if !matches!(self.init.get(), Some(Ok(()))) {
      return Vec::new();
    }
    self
      .entries
      .iter()
      .filter(|(_, entry)| entry.state() == LoadState::Ready)
      .map(|(_, entry)| entry.predictor.describe())
      .collect()
  }

  fn entry(&self, kind: ModelKind) -> Option<&Entry> {
    self
      .entries
      .iter()
      .find(|(k, _)| *k == kind)
      .map(|(_, entry)| entry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
  };

  use async_trait::async_trait;
  use image::RgbImage;

  use crate::{
    artifact::{ArtifactError, ArtifactSource},
    model::{InferenceOptions, PredictionBatch, PredictorError},
  };

  struct NoopFetcher;

  #[async_trait]
  impl ArtifactFetcher for NoopFetcher {
    async fn fetch_to_local_cache(
      &self,
      _source: &ArtifactSource,
      cache_name: &str,
    ) -> Result<PathBuf, ArtifactError> {
      Ok(PathBuf::from(cache_name))
    }
  }

  struct CountingPredictor {
    kind: ModelKind,
    loads: Arc<AtomicUsize>,
    fail: bool,
  }

  #[async_trait]
  impl Predictor for CountingPredictor {
    fn kind(&self) -> ModelKind {
      self.kind
    }

    async fn load(&self, _fetcher: &dyn ArtifactFetcher) -> Result<(), PredictorError> {
      self.loads.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      if self.fail {
        return Err(PredictorError::Runtime("weights missing".to_string()));
      }
      Ok(())
    }

    fn infer(&self, image: &RgbImage) -> Result<PredictionBatch, PredictorError> {
      Ok(PredictionBatch {
        items: Box::new([]),
        image_shape: crate::input::image_shape(image),
        processing_time_ms: 0.0,
        model: self.kind,
      })
    }

    fn describe(&self) -> ModelMetadata {
      InferenceOptions::default().metadata(self.kind, "mock", "mock", "mock")
    }
  }

  fn registry(fail_maskrcnn: bool) -> (ModelRegistry, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let yolo_loads = Arc::new(AtomicUsize::new(0));
    let maskrcnn_loads = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::new(
      ModelKind::Yolo,
      Arc::new(NoopFetcher),
      vec![
        Arc::new(CountingPredictor {
          kind: ModelKind::Yolo,
          loads: yolo_loads.clone(),
          fail: false,
        }),
        Arc::new(CountingPredictor {
          kind: ModelKind::MaskRcnn,
          loads: maskrcnn_loads.clone(),
          fail: fail_maskrcnn,
        }),
      ],
    );
    (registry, yolo_loads, maskrcnn_loads)
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_first_use_loads_once() {
    let (registry, yolo_loads, maskrcnn_loads) = registry(false);
    let registry = Arc::new(registry);

    let handles: Vec<_> = (0..8)
      .map(|i| {
        let registry = registry.clone();
        tokio::spawn(async move {
          let id = if i % 2 == 0 { "yolo" } else { "maskrcnn" };
          registry.resolve(Some(id)).await.map(|p| p.kind())
        })
      })
      .collect();

    for handle in handles {
      assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(yolo_loads.load(Ordering::SeqCst), 1);
    assert_eq!(maskrcnn_loads.load(Ordering::SeqCst), 1);
    assert!(registry.is_ready());
    assert_eq!(registry.describe_all().len(), 2);
  }

  #[tokio::test]
  async fn test_resolve_default_and_unknown() {
    let (registry, yolo_loads, _) = registry(false);

    assert_eq!(
      registry.resolve(Some("bogus")).await.err(),
      Some(RegistryError::UnknownModelType("bogus".to_string()))
    );
    // 未知标识在加载之前就被拒绝
    assert_eq!(yolo_loads.load(Ordering::SeqCst), 0);
    assert_eq!(registry.state(ModelKind::Yolo), Some(LoadState::Uninitialized));

    let predictor = registry.resolve(None).await.unwrap();
    assert_eq!(predictor.kind(), ModelKind::Yolo);
    let info = registry.model_info(Some("maskrcnn")).await.unwrap();
    assert_eq!(info.model_type, ModelKind::MaskRcnn);
  }

  #[tokio::test]
  async fn test_unregistered_kind_is_unknown() {
    let registry = ModelRegistry::new(
      ModelKind::Yolo,
      Arc::new(NoopFetcher),
      vec![Arc::new(CountingPredictor {
        kind: ModelKind::Yolo,
        loads: Arc::new(AtomicUsize::new(0)),
        fail: false,
      })],
    );
    assert_eq!(
      registry.resolve(Some("maskrcnn")).await.err(),
      Some(RegistryError::UnknownModelType("maskrcnn".to_string()))
    );
    assert_eq!(registry.registered().collect::<Vec<_>>(), vec![ModelKind::Yolo]);
  }

  #[tokio::test]
  async fn test_failure_is_memoized() {
    let (registry, yolo_loads, maskrcnn_loads) = registry(true);

    let err = registry.initialize_all().await.unwrap_err();
    assert!(matches!(
      err,
      RegistryError::LoadFailed {
        model: ModelKind::MaskRcnn,
        ..
      }
    ));
    assert!(!registry.is_ready());
    assert!(registry.describe_all().is_empty());
    assert!(matches!(
      registry.state(ModelKind::MaskRcnn),
      Some(LoadState::FailedToLoad(_))
    ));

    // 第二次调用不会重新加载，且 yolo 也不可用
    assert_eq!(registry.initialize_all().await.unwrap_err(), err);
    assert!(matches!(
      registry.resolve(Some("yolo")).await,
      Err(RegistryError::ModelNotReady {
        model: ModelKind::Yolo,
        ..
      })
    ));
    assert_eq!(yolo_loads.load(Ordering::SeqCst), 1);
    assert_eq!(maskrcnn_loads.load(Ordering::SeqCst), 1);
  }
}
