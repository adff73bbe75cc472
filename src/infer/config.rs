// 该文件是 Dongfeng （东风） 项目的一部分。
// src/infer/config.rs - 推理服务配置
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

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, warn};
use url::Url;

use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::model::YoloVariant;
use crate::model::nms::NmsMethod;
use crate::model::postprocess::PostprocessConfig;
use crate::{FromUrl, FromUrlWithScheme};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MAX_OBJECTS: usize = 1024;
pub const DEFAULT_MAX_BATCH_DELAY: Duration = Duration::from_millis(2);

const ENGINE_SCHEME: &str = "engine";

/// 推理服务配置
#[derive(Debug, Clone, PartialEq)]
pub struct InferConfig {
  pub engine_file: PathBuf,
  pub variant: YoloVariant,
  pub device_id: DeviceId,
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub nms_method: NmsMethod,
  pub max_objects: usize,
  pub use_multi_preprocess_stream: bool,
  pub max_batch_delay: Duration,
}

impl InferConfig {
  pub fn new(engine_file: impl Into<PathBuf>, variant: YoloVariant) -> Self {
    Self {
      engine_file: engine_file.into(),
      variant,
      device_id: 0,
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      nms_method: NmsMethod::default(),
      max_objects: DEFAULT_MAX_OBJECTS,
      use_multi_preprocess_stream: false,
      max_batch_delay: DEFAULT_MAX_BATCH_DELAY,
    }
  }

  pub fn device_id(mut self, device_id: DeviceId) -> Self {
    self.device_id = device_id;
    self
  }

  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn nms_threshold(mut self, threshold: f32) -> Self {
    self.nms_threshold = threshold;
    self
  }

  pub fn nms_method(mut self, method: NmsMethod) -> Self {
    self.nms_method = method;
    self
  }

  pub fn max_objects(mut self, max_objects: usize) -> Self {
    self.max_objects = max_objects;
    self
  }

  pub fn multi_preprocess_stream(mut self, enable: bool) -> Self {
    self.use_multi_preprocess_stream = enable;
    self
  }

  pub fn max_batch_delay(mut self, delay: Duration) -> Self {
    self.max_batch_delay = delay;
    self
  }

  pub fn engine_file(&self) -> &Path {
    &self.engine_file
  }

  /// 检查阈值范围
  pub fn validate(&self) -> Result<()> {
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(Error::Configuration(format!(
        "置信度阈值 {} 不在 [0, 1] 内",
        self.confidence_threshold
      )));
    }
    if !(0.0..=1.0).contains(&self.nms_threshold) {
      return Err(Error::Configuration(format!(
        "NMS 阈值 {} 不在 [0, 1] 内",
        self.nms_threshold
      )));
    }
    if self.max_objects == 0 {
      return Err(Error::Configuration("最大目标数为 0".to_string()));
    }
    Ok(())
  }

  pub(crate) fn postprocess(&self) -> PostprocessConfig {
    PostprocessConfig {
      confidence_threshold: self.confidence_threshold,
      nms_threshold: self.nms_threshold,
      nms_method: self.nms_method,
      max_objects: self.max_objects,
    }
  }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
  value
    .parse()
    .map_err(|_| Error::Configuration(format!("参数 {} 的值无效: {}", key, value)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
  match value {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(Error::Configuration(format!(
      "参数 {} 的值无效: {}",
      key, value
    ))),
  }
}

impl FromUrl for InferConfig {
  type Error = Error;

  /// `engine:///path/to/m.FP32.cpu-reference.engine?variant=v5&device=0&confidence=0.25`
  fn from_url(url: &Url) -> Result<Self> {
    if url.scheme() != ENGINE_SCHEME {
      error!(
        "URI scheme 不匹配: 期望 '{}', 实际 '{}'",
        ENGINE_SCHEME,
        url.scheme()
      );
      return Err(Error::Configuration(format!(
        "引擎路径必须使用 {} 方案",
        ENGINE_SCHEME
      )));
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| Error::Configuration(format!("引擎路径编码无效: {}", e)))?
      .into_owned();
    if path.is_empty() {
      return Err(Error::Configuration("引擎路径为空".to_string()));
    }

    let mut config = InferConfig::new(path, YoloVariant::V5);

    for (key, value) in url.query_pairs() {
      match &*key {
        "variant" => {
          config.variant = YoloVariant::parse(&value).ok_or_else(|| {
            Error::Configuration(format!("未知的网络类型: {}", value))
          })?
        }
        "device" => config.device_id = parse_value(&key, &value)?,
        "confidence" => config.confidence_threshold = parse_value(&key, &value)?,
        "nms" => config.nms_threshold = parse_value(&key, &value)?,
        "nms_method" => {
          config.nms_method = NmsMethod::parse(&value).ok_or_else(|| {
            Error::Configuration(format!("未知的 NMS 方法: {}", value))
          })?
        }
        "max_objects" => config.max_objects = parse_value(&key, &value)?,
        "multi_stream" => config.use_multi_preprocess_stream = parse_flag(&key, &value)?,
        "max_delay_ms" => {
          config.max_batch_delay = Duration::from_millis(parse_value(&key, &value)?)
        }
        other => warn!("忽略未知参数: {}={}", other, value),
      }
    }

    config.validate()?;
    Ok(config)
  }
}

impl FromUrlWithScheme for InferConfig {
  const SCHEME: &'static str = ENGINE_SCHEME;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_follow_the_demo_settings() {
    let config = InferConfig::new("m.engine", YoloVariant::X);
    assert_eq!(config.confidence_threshold, 0.25);
    assert_eq!(config.nms_threshold, 0.45);
    assert_eq!(config.nms_method, NmsMethod::Accelerated);
    assert_eq!(config.max_objects, 1024);
    assert!(!config.use_multi_preprocess_stream);
    assert_eq!(config.max_batch_delay, Duration::from_millis(2));
    assert_eq!(config.device_id, 0);
  }

  #[test]
  fn parses_engine_url() {
    let url = Url::parse(
      "engine:///tmp/my%20models/m.FP16.cpu-reference.engine?variant=x&device=1&confidence=0.4&nms=0.5&nms_method=cpu&max_objects=10&multi_stream=1&max_delay_ms=5",
    )
    .unwrap();
    let config = InferConfig::from_url(&url).unwrap();
    assert_eq!(
      config.engine_file,
      PathBuf::from("/tmp/my models/m.FP16.cpu-reference.engine")
    );
    assert_eq!(config.variant, YoloVariant::X);
    assert_eq!(config.device_id, 1);
    assert_eq!(config.confidence_threshold, 0.4);
    assert_eq!(config.nms_threshold, 0.5);
    assert_eq!(config.nms_method, NmsMethod::Reference);
    assert_eq!(config.max_objects, 10);
    assert!(config.use_multi_preprocess_stream);
    assert_eq!(config.max_batch_delay, Duration::from_millis(5));
  }

  #[test]
  fn rejects_wrong_scheme_and_bad_values() {
    let wrong = Url::parse("file:///tmp/m.engine").unwrap();
    assert!(matches!(
      InferConfig::from_url(&wrong),
      Err(Error::Configuration(_))
    ));
    let bad = Url::parse("engine:///tmp/m.engine?confidence=2").unwrap();
    assert!(InferConfig::from_url(&bad).is_err());
    let bad = Url::parse("engine:///tmp/m.engine?variant=v8").unwrap();
    assert!(InferConfig::from_url(&bad).is_err());
  }
}
