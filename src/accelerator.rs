// 该文件是 Dongfeng （东风） 项目的一部分。
// src/accelerator.rs - 推理加速器接口
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

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::engine::Precision;
use crate::error::Result;
use crate::model::NetworkDescription;
use crate::tensor::Tensor;

mod reference;
pub use self::reference::CpuAccelerator;

/// Int8 量化表
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationTable {
  pub input_min: f32,
  pub input_max: f32,
  pub scale: f32,
}

impl QuantizationTable {
  pub fn from_range(input_min: f32, input_max: f32) -> Self {
    let amax = input_min.abs().max(input_max.abs());
    let scale = if amax > 0.0 { amax / 127.0 } else { 1.0 };
    Self {
      input_min,
      input_max,
      scale,
    }
  }

  pub fn fake_quantize(&self, v: f32) -> f32 {
    (v / self.scale).round().clamp(-127.0, 127.0) * self.scale
  }
}

/// 加速器编译得到的执行计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPlan {
  pub network: NetworkDescription,
  pub precision: Precision,
  pub max_batch_size: usize,
  pub quantization: Option<QuantizationTable>,
}

/// 推理加速器
pub trait Accelerator: Send + Sync {
  /// 加速器目标名称，参与引擎缓存键
  fn target(&self) -> &str;

  /// 编译网络，失败时返回拒绝原因
  fn compile(
    &self,
    network: &NetworkDescription,
    precision: Precision,
    max_batch_size: usize,
    quantization: Option<QuantizationTable>,
  ) -> Result<CompiledPlan, String>;

  /// 在指定设备上加载执行计划
  fn load(&self, plan: &CompiledPlan, device_id: DeviceId) -> Result<Box<dyn Execution>>;
}

/// 已加载的执行上下文
pub trait Execution: Send {
  /// 对张量的前 `batch` 个位置执行推理，返回每张图的原始候选框输出
  fn forward(&mut self, input: &Tensor, batch: usize) -> Result<Vec<Vec<f32>>>;
}
