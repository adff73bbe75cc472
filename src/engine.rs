// 该文件是 Dongfeng （东风） 项目的一部分。
// src/engine.rs - 引擎构建
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

//! # 引擎构建
//!
//! [`EngineBuilder`] 把模型源文件编译为特定加速器、特定精度的引擎文件。
//! 引擎文件按 `{模型名, 精度, 加速器}` 命名，已存在时直接复用，不会重新编译。
//!
//! ```no_run
//! use std::{path::Path, sync::Arc};
//! use dongfeng::{accelerator::CpuAccelerator, engine::{EngineBuilder, Precision}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let builder = EngineBuilder::new(Arc::new(CpuAccelerator::new())).device_id(0);
//! let artifact = builder.build(Path::new("yolov5s.json"), Precision::Fp32, 16, None)?;
//! println!("{}", artifact.key.file_name());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::accelerator::{Accelerator, CompiledPlan, QuantizationTable};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::model::NetworkDescription;
use crate::preprocess::image_to_tensor;
use crate::tensor::Tensor;

pub mod calibration;
pub use self::calibration::{CalibrationSource, FrameCalibration};
#[cfg(feature = "read_image_file")]
pub use self::calibration::ImageFolderCalibration;

const ARTIFACT_FORMAT_VERSION: u32 = 1;
const ARTIFACT_EXTENSION: &str = "engine";
const DEFAULT_MIN_CALIBRATION_BATCHES: usize = 1;

/// 推理精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
  Fp32,
  Fp16,
  Int8,
}

impl Precision {
  pub fn mode_string(&self) -> &'static str {
    match self {
      Precision::Fp32 => "FP32",
      Precision::Fp16 => "FP16",
      Precision::Int8 => "INT8",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_uppercase().as_str() {
      "FP32" | "FULL" => Some(Precision::Fp32),
      "FP16" | "HALF" => Some(Precision::Fp16),
      "INT8" => Some(Precision::Int8),
      _ => None,
    }
  }
}

/// 引擎缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  pub model: String,
  pub precision: Precision,
  pub target: String,
}

impl CacheKey {
  pub fn file_name(&self) -> String {
    format!(
      "{}.{}.{}.{}",
      self.model,
      self.precision.mode_string(),
      self.target,
      ARTIFACT_EXTENSION
    )
  }
}

/// 编译好的引擎，构建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineArtifact {
  pub format_version: u32,
  pub key: CacheKey,
  pub plan: CompiledPlan,
  pub built_at: String,
}

impl EngineArtifact {
  pub fn load(path: &Path) -> Result<Self> {
    let data = std::fs::read(path).map_err(|e| {
      Error::Configuration(format!("无法读取引擎文件 {}: {}", path.display(), e))
    })?;
    let artifact: EngineArtifact = serde_json::from_slice(&data)?;
    if artifact.format_version != ARTIFACT_FORMAT_VERSION {
      return Err(Error::Configuration(format!(
        "引擎文件 {} 版本 {} 不受支持",
        path.display(),
        artifact.format_version
      )));
    }
    Ok(artifact)
  }

  pub fn max_batch_size(&self) -> usize {
    self.plan.max_batch_size
  }

  pub fn network(&self) -> &NetworkDescription {
    &self.plan.network
  }

  /// 先写临时文件再重命名，失败时不会留下不完整的引擎
  fn persist(&self, path: &Path) -> Result<()> {
    let data = serde_json::to_vec_pretty(self)
      .map_err(|e| Error::Build(format!("引擎序列化失败: {}", e)))?;
    let partial = partial_path(path);
    if let Err(e) = std::fs::write(&partial, &data).and_then(|_| std::fs::rename(&partial, path)) {
      let _ = std::fs::remove_file(&partial);
      return Err(Error::Build(format!(
        "无法写入引擎文件 {}: {}",
        path.display(),
        e
      )));
    }
    Ok(())
  }
}

fn partial_path(path: &Path) -> PathBuf {
  let mut name = path.file_name().unwrap_or_default().to_os_string();
  name.push(".partial");
  path.with_file_name(name)
}

/// 模型名：模型源文件去掉扩展名
fn model_identity(source_model: &Path) -> Result<String> {
  source_model
    .file_stem()
    .and_then(|s| s.to_str())
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .ok_or_else(|| {
      Error::Configuration(format!("无效的模型路径: {}", source_model.display()))
    })
}

pub struct EngineBuilder {
  accelerator: Arc<dyn Accelerator>,
  device_id: DeviceId,
  artifact_dir: Option<PathBuf>,
  min_calibration_batches: usize,
  compilations: AtomicUsize,
}

impl EngineBuilder {
  pub fn new(accelerator: Arc<dyn Accelerator>) -> Self {
    Self {
      accelerator,
      device_id: 0,
      artifact_dir: None,
      min_calibration_batches: DEFAULT_MIN_CALIBRATION_BATCHES,
      compilations: AtomicUsize::new(0),
    }
  }

  pub fn device_id(mut self, device_id: DeviceId) -> Self {
    self.device_id = device_id;
    self
  }

  /// 引擎文件目录，默认与模型源文件相同
  pub fn artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.artifact_dir = Some(dir.into());
    self
  }

  pub fn min_calibration_batches(mut self, batches: usize) -> Self {
    self.min_calibration_batches = batches.max(1);
    self
  }

  /// 实际执行编译的次数
  pub fn compilations(&self) -> usize {
    self.compilations.load(Ordering::Acquire)
  }

  pub fn cache_key(&self, source_model: &Path, precision: Precision) -> Result<CacheKey> {
    Ok(CacheKey {
      model: model_identity(source_model)?,
      precision,
      target: self.accelerator.target().to_string(),
    })
  }

  pub fn artifact_path(&self, source_model: &Path, precision: Precision) -> Result<PathBuf> {
    let key = self.cache_key(source_model, precision)?;
    let dir = match &self.artifact_dir {
      Some(dir) => dir.clone(),
      None => source_model
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default(),
    };
    Ok(dir.join(key.file_name()))
  }

  /// 构建引擎；匹配的引擎文件已存在时直接读取返回
  pub fn build(
    &self,
    source_model: &Path,
    precision: Precision,
    max_batch_size: usize,
    calibration: Option<&mut dyn CalibrationSource>,
  ) -> Result<EngineArtifact> {
    let key = self.cache_key(source_model, precision)?;
    let path = self.artifact_path(source_model, precision)?;

    if path.exists() {
      info!("复用已存在的引擎文件: {}", path.display());
      let artifact = EngineArtifact::load(&path)?;
      if artifact.key != key {
        return Err(Error::Configuration(format!(
          "引擎文件 {} 的缓存键与请求不一致",
          path.display()
        )));
      }
      return Ok(artifact);
    }

    if max_batch_size == 0 {
      return Err(Error::Configuration("最大批大小必须大于 0".to_string()));
    }

    info!(
      "编译引擎: {} -> {} (设备 {})",
      source_model.display(),
      path.display(),
      self.device_id
    );
    let network = NetworkDescription::load(source_model)?;

    let quantization = match (precision, calibration) {
      (Precision::Int8, None) => {
        return Err(Error::Configuration(
          "INT8 精度需要提供校准数据".to_string(),
        ));
      }
      (Precision::Int8, Some(source)) => {
        Some(self.calibrate(&network, max_batch_size, source)?)
      }
      (_, Some(_)) => {
        warn!("{} 精度不需要校准数据，已忽略", precision.mode_string());
        None
      }
      (_, None) => None,
    };

    let plan = self
      .accelerator
      .compile(&network, precision, max_batch_size, quantization)
      .map_err(|reason| {
        error!("加速器拒绝编译: {}", reason);
        Error::Build(reason)
      })?;
    self.compilations.fetch_add(1, Ordering::AcqRel);

    let artifact = EngineArtifact {
      format_version: ARTIFACT_FORMAT_VERSION,
      key,
      plan,
      built_at: chrono::Utc::now().to_rfc3339(),
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
      std::fs::create_dir_all(dir)?;
    }
    artifact.persist(&path)?;
    info!("引擎已保存: {}", path.display());

    Ok(artifact)
  }

  /// 引擎文件不存在时才编译，返回引擎文件路径
  pub fn compile_if_missing(
    &self,
    source_model: &Path,
    precision: Precision,
    max_batch_size: usize,
    calibration: Option<&mut dyn CalibrationSource>,
  ) -> Result<PathBuf> {
    self.build(source_model, precision, max_batch_size, calibration)?;
    self.artifact_path(source_model, precision)
  }

  fn calibrate(
    &self,
    network: &NetworkDescription,
    max_batch_size: usize,
    source: &mut dyn CalibrationSource,
  ) -> Result<QuantizationTable> {
    source
      .reset()
      .map_err(|e| Error::Calibration(format!("无法重置校准数据: {}", e)))?;

    let mut batches = 0usize;
    let mut input_min = f32::MAX;
    let mut input_max = f32::MIN;

    while let Some(frames) = source
      .next_batch()
      .map_err(|e| Error::Calibration(format!("读取校准数据失败: {}", e)))?
    {
      if frames.is_empty() {
        return Err(Error::Calibration(format!("第 {} 批校准数据为空", batches)));
      }
      if frames.len() > max_batch_size {
        return Err(Error::Calibration(format!(
          "第 {} 批校准数据大小 {} 超过最大批大小 {}",
          batches,
          frames.len(),
          max_batch_size
        )));
      }

      match source.len_hint() {
        Some(total) => info!("Int8 {} / {}", batches + 1, total),
        None => info!("Int8 {}", batches + 1),
      }
      let mut tensor = Tensor::input(frames.len(), network.input_height, network.input_width);
      for (ibatch, frame) in frames.iter().enumerate() {
        image_to_tensor(frame, network.variant, &mut tensor, ibatch, None).map_err(|e| {
          Error::Calibration(format!("第 {} 批第 {} 帧无效: {}", batches, ibatch, e))
        })?;
      }
      for &v in tensor.as_array() {
        input_min = input_min.min(v);
        input_max = input_max.max(v);
      }
      batches += 1;
    }

    if batches < self.min_calibration_batches {
      return Err(Error::Calibration(format!(
        "校准数据不足: 需要至少 {} 批，实际 {} 批",
        self.min_calibration_batches, batches
      )));
    }

    let table = QuantizationTable::from_range(input_min, input_max);
    debug!(
      "校准完成: {} 批, 输入范围 [{}, {}], 缩放 {}",
      batches, table.input_min, table.input_max, table.scale
    );
    Ok(table)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cache_key_file_name() {
    let key = CacheKey {
      model: "yolov5s".to_string(),
      precision: Precision::Fp16,
      target: "cpu-reference".to_string(),
    };
    assert_eq!(key.file_name(), "yolov5s.FP16.cpu-reference.engine");
  }

  #[test]
  fn precision_names() {
    assert_eq!(Precision::parse("int8"), Some(Precision::Int8));
    assert_eq!(Precision::parse("half"), Some(Precision::Fp16));
    assert_eq!(Precision::parse("fp64"), None);
    assert_eq!(Precision::Fp32.mode_string(), "FP32");
  }

  #[test]
  fn partial_path_is_a_sibling() {
    let p = partial_path(Path::new("/tmp/a/m.FP32.cpu.engine"));
    assert_eq!(p, PathBuf::from("/tmp/a/m.FP32.cpu.engine.partial"));
  }

  #[test]
  fn model_identity_is_the_file_stem() {
    assert_eq!(model_identity(Path::new("/m/yolov5s.json")).unwrap(), "yolov5s");
    assert!(model_identity(Path::new("/")).is_err());
  }
}
