// 该文件是 Jizhu （脊柱） 项目的一部分。
// src/artifact.rs - 模型权重的获取与本地缓存
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

use std::{
  fmt,
  path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("URI scheme mismatch: unsupported scheme '{0}'")]
  SchemeMismatch(String),
  #[error("invalid artifact location '{location}': {reason}")]
  InvalidLocation { location: String, reason: String },
  #[error("artifact not found: {0}")]
  NotFound(String),
  #[error("download of {url} failed: {reason}")]
  Download { url: String, reason: String },
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),
}

/// 对象存储中的一个对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Object {
  pub bucket: String,
  pub key: String,
}

impl FromUrl for S3Object {
  type Error = ArtifactError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ArtifactError::SchemeMismatch(url.scheme().to_string()));
    }

    let bucket = url.host_str().unwrap_or_default();
    let key = url.path().trim_start_matches('/');
    if bucket.is_empty() || key.is_empty() {
      return Err(ArtifactError::InvalidLocation {
        location: url.to_string(),
        reason: "expected s3://<bucket>/<key>".to_string(),
      });
    }

    Ok(S3Object {
      bucket: bucket.to_string(),
      key: key.to_string(),
    })
  }
}

impl FromUrlWithScheme for S3Object {
  const SCHEME: &'static str = "s3";
}

impl S3Object {
  /// 对象的 HTTPS 下载地址
  ///
  /// 未指定 `endpoint` 时使用虚拟主机风格的 AWS 地址，
  /// 否则使用 `<endpoint>/<bucket>/<key>` 的路径风格（适用于 MinIO 等兼容实现）。
  pub fn https_url(&self, region: &str, endpoint: Option<&Url>) -> Result<Url, ArtifactError> {
    let raw = match endpoint {
      Some(endpoint) => format!(
        "{}/{}/{}",
        endpoint.as_str().trim_end_matches('/'),
        self.bucket,
        self.key
      ),
      None => format!(
        "https://{}.s3.{}.amazonaws.com/{}",
        self.bucket, region, self.key
      ),
    };
    Url::parse(&raw).map_err(|e| ArtifactError::InvalidLocation {
      location: raw.clone(),
      reason: e.to_string(),
    })
  }
}

impl fmt::Display for S3Object {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "s3://{}/{}", self.bucket, self.key)
  }
}

/// 模型权重的来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
  File(PathBuf),
  Http(Url),
  S3(S3Object),
}

impl FromUrl for ArtifactSource {
  type Error = ArtifactError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      "file" => url
        .to_file_path()
        .map(ArtifactSource::File)
        .map_err(|_| ArtifactError::InvalidLocation {
          location: url.to_string(),
          reason: "not a local file path".to_string(),
        }),
      "http" | "https" => Ok(ArtifactSource::Http(url.clone())),
      scheme if scheme == S3Object::SCHEME => S3Object::from_url(url).map(ArtifactSource::S3),
      scheme => Err(ArtifactError::SchemeMismatch(scheme.to_string())),
    }
  }
}

impl ArtifactSource {
  /// 解析配置中的模型位置
  ///
  /// 可以是完整的 URL（`s3://`、`https://`、`file://`）或绝对路径，
  /// 其余情况视为默认桶中的对象键。
  pub fn resolve(location: &str, default_bucket: &str) -> Result<Self, ArtifactError> {
    if location.starts_with('/') {
      return Ok(ArtifactSource::File(PathBuf::from(location)));
    }

    match Url::parse(location) {
      Ok(url) => Self::from_url(&url),
      Err(url::ParseError::RelativeUrlWithoutBase) => Ok(ArtifactSource::S3(S3Object {
        bucket: default_bucket.to_string(),
        key: location.to_string(),
      })),
      Err(e) => Err(ArtifactError::InvalidLocation {
        location: location.to_string(),
        reason: e.to_string(),
      }),
    }
  }
}

impl fmt::Display for ArtifactSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ArtifactSource::File(path) => write!(f, "{}", path.display()),
      ArtifactSource::Http(url) => write!(f, "{url}"),
      ArtifactSource::S3(object) => write!(f, "{object}"),
    }
  }
}

/// 将模型权重放到本地，返回可直接加载的路径
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
  async fn fetch_to_local_cache(
    &self,
    source: &ArtifactSource,
    cache_name: &str,
  ) -> Result<PathBuf, ArtifactError>;
}

/// 以缓存目录为准的下载器：缓存命中时不访问网络
pub struct CachedArtifactFetcher {
  cache_dir: PathBuf,
  region: String,
  endpoint: Option<Url>,
  client: reqwest::Client,
}

impl CachedArtifactFetcher {
  pub fn new(cache_dir: impl Into<PathBuf>, region: impl Into<String>, endpoint: Option<Url>) -> Self {
    Self {
      cache_dir: cache_dir.into(),
      region: region.into(),
      endpoint,
      client: reqwest::Client::new(),
    }
  }

  async fn download(&self, url: &Url, target: &Path) -> Result<(), ArtifactError> {
    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let result = self.download_to(url, &partial).await;
    match result {
      Ok(()) => {
        tokio::fs::rename(&partial, target).await?;
        Ok(())
      }
      Err(e) => {
        // 不留下半截文件，下次启动会重新下载
        if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
          warn!("清理临时文件失败 {}: {}", partial.display(), cleanup);
        }
        Err(e)
      }
    }
  }

  async fn download_to(&self, url: &Url, path: &Path) -> Result<(), ArtifactError> {
    let download_error = |e: reqwest::Error| ArtifactError::Download {
      url: url.to_string(),
      reason: e.to_string(),
    };

    let mut response = self
      .client
      .get(url.clone())
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(download_error)?;

    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0usize;
    while let Some(chunk) = response.chunk().await.map_err(download_error)? {
      file.write_all(&chunk).await?;
      written += chunk.len();
    }
    file.flush().await?;
    info!("下载完成: {} ({} 字节)", url, written);
    Ok(())
  }
}

#[async_trait]
impl ArtifactFetcher for CachedArtifactFetcher {
  async fn fetch_to_local_cache(
    &self,
    source: &ArtifactSource,
    cache_name: &str,
  ) -> Result<PathBuf, ArtifactError> {
    let url = match source {
      ArtifactSource::File(path) => {
        if tokio::fs::try_exists(path).await? {
          return Ok(path.clone());
        }
        return Err(ArtifactError::NotFound(path.display().to_string()));
      }
      ArtifactSource::Http(url) => url.clone(),
      ArtifactSource::S3(object) => object.https_url(&self.region, self.endpoint.as_ref())?,
    };

    let target = self.cache_dir.join(cache_name);
    if tokio::fs::try_exists(&target).await? {
      info!("使用缓存的模型: {}", target.display());
      return Ok(target);
    }

    tokio::fs::create_dir_all(&self.cache_dir).await?;
    info!("从 {} 下载模型到 {}", source, target.display());
    self.download(&url, &target).await?;
    Ok(target)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_bare_key_uses_default_bucket() {
    let source = ArtifactSource::resolve("yolo_best.onnx", "vertebrae-artifacts").unwrap();
    assert_eq!(
      source,
      ArtifactSource::S3(S3Object {
        bucket: "vertebrae-artifacts".to_string(),
        key: "yolo_best.onnx".to_string(),
      })
    );
    assert_eq!(source.to_string(), "s3://vertebrae-artifacts/yolo_best.onnx");
  }

  #[test]
  fn test_resolve_urls() {
    let s3 = ArtifactSource::resolve("s3://models/seg/model_final.onnx", "unused").unwrap();
    assert_eq!(
      s3,
      ArtifactSource::S3(S3Object {
        bucket: "models".to_string(),
        key: "seg/model_final.onnx".to_string(),
      })
    );

    let http = ArtifactSource::resolve("https://example.com/m.onnx", "unused").unwrap();
    assert!(matches!(http, ArtifactSource::Http(_)));

    let file = ArtifactSource::resolve("file:///opt/models/m.onnx", "unused").unwrap();
    assert_eq!(file, ArtifactSource::File(PathBuf::from("/opt/models/m.onnx")));

    let path = ArtifactSource::resolve("/opt/models/m.onnx", "unused").unwrap();
    assert_eq!(path, ArtifactSource::File(PathBuf::from("/opt/models/m.onnx")));

    assert!(matches!(
      ArtifactSource::resolve("ftp://example.com/m.onnx", "unused"),
      Err(ArtifactError::SchemeMismatch(_))
    ));
    assert!(matches!(
      ArtifactSource::resolve("s3://bucket-only", "unused"),
      Err(ArtifactError::InvalidLocation { .. })
    ));
  }

  #[test]
  fn test_s3_https_url() {
    let object = S3Object {
      bucket: "vertebrae-artifacts".to_string(),
      key: "yolo_best.onnx".to_string(),
    };
    assert_eq!(
      object.https_url("us-east-1", None).unwrap().as_str(),
      "https://vertebrae-artifacts.s3.us-east-1.amazonaws.com/yolo_best.onnx"
    );
    let endpoint = Url::parse("http://localhost:9000/").unwrap();
    assert_eq!(
      object.https_url("us-east-1", Some(&endpoint)).unwrap().as_str(),
      "http://localhost:9000/vertebrae-artifacts/yolo_best.onnx"
    );
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let dir = tempfile::tempdir().unwrap();
    let cached = dir.path().join("yolo_model.onnx");
    std::fs::write(&cached, b"weights").unwrap();

    let fetcher = CachedArtifactFetcher::new(dir.path(), "us-east-1", None);
    // 端口 9 上没有服务，若真的发起请求会失败
    let source = ArtifactSource::Http(Url::parse("http://127.0.0.1:9/yolo.onnx").unwrap());
    let path = fetcher
      .fetch_to_local_cache(&source, "yolo_model.onnx")
      .await
      .unwrap();
    assert_eq!(path, cached);
  }

  #[tokio::test]
  async fn test_local_file_source() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("local.onnx");
    std::fs::write(&model, b"weights").unwrap();

    let fetcher = CachedArtifactFetcher::new(dir.path().join("cache"), "us-east-1", None);
    let path = fetcher
      .fetch_to_local_cache(&ArtifactSource::File(model.clone()), "maskrcnn_model.onnx")
      .await
      .unwrap();
    assert_eq!(path, model);

    let missing = fetcher
      .fetch_to_local_cache(
        &ArtifactSource::File(dir.path().join("missing.onnx")),
        "maskrcnn_model.onnx",
      )
      .await;
    assert!(matches!(missing, Err(ArtifactError::NotFound(_))));
  }

  #[tokio::test]
  async fn test_failed_download_leaves_no_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CachedArtifactFetcher::new(dir.path(), "us-east-1", None);
    let source = ArtifactSource::Http(Url::parse("http://127.0.0.1:9/yolo.onnx").unwrap());

    let result = fetcher.fetch_to_local_cache(&source, "yolo_model.onnx").await;
    assert!(matches!(result, Err(ArtifactError::Download { .. })));
    assert!(!dir.path().join("yolo_model.onnx").exists());
    assert!(!dir.path().join("yolo_model.onnx.part").exists());
  }
}
