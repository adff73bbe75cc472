// 该文件是 Dongfeng （东风） 项目的一部分。
// src/accelerator/reference.rs - CPU 参考加速器
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

//! CPU 参考加速器
//!
//! 用网格检测器代替真实网络：每个 `stride x stride` 单元按各通道的平均激活打分，
//! 低于 letterbox 填充亮度的部分视为背景。纯黑图像没有任何输出，
//! 明亮的色块在其覆盖的每个单元上产生一个框，类别为占主导的通道。

use half::f16;
use tracing::{debug, info};

use crate::accelerator::{Accelerator, CompiledPlan, Execution, QuantizationTable};
use crate::device::DeviceId;
use crate::engine::Precision;
use crate::error::{Error, Result};
use crate::model::{NetworkDescription, YoloVariant};
use crate::tensor::{INPUT_CHANNELS, Tensor};

const REFERENCE_TARGET: &str = "cpu-reference";
const BACKGROUND_LEVEL: f32 = 114.0 / 255.0;

#[derive(Debug, Default, Clone)]
pub struct CpuAccelerator;

impl CpuAccelerator {
  pub fn new() -> Self {
    Self
  }
}

impl Accelerator for CpuAccelerator {
  fn target(&self) -> &str {
    REFERENCE_TARGET
  }

  fn compile(
    &self,
    network: &NetworkDescription,
    precision: Precision,
    max_batch_size: usize,
    quantization: Option<QuantizationTable>,
  ) -> Result<CompiledPlan, String> {
    if network.num_classes == 0 {
      return Err("网络类别数为 0".to_string());
    }
    if network.stride == 0 {
      return Err("网络步长为 0".to_string());
    }
    if network.input_width == 0
      || network.input_height == 0
      || network.input_width % network.stride != 0
      || network.input_height % network.stride != 0
    {
      return Err(format!(
        "输入尺寸 {}x{} 不能被步长 {} 整除",
        network.input_width, network.input_height, network.stride
      ));
    }
    if max_batch_size == 0 {
      return Err("最大批大小为 0".to_string());
    }
    if precision == Precision::Int8 && quantization.is_none() {
      return Err("INT8 精度缺少量化表".to_string());
    }

    info!(
      "编译网络 {} ({}, 最大批大小 {})",
      network.name,
      precision.mode_string(),
      max_batch_size
    );
    Ok(CompiledPlan {
      network: network.clone(),
      precision,
      max_batch_size,
      quantization: if precision == Precision::Int8 {
        quantization
      } else {
        None
      },
    })
  }

  fn load(&self, plan: &CompiledPlan, device_id: DeviceId) -> Result<Box<dyn Execution>> {
    if plan.network.stride == 0 || plan.network.num_classes == 0 {
      return Err(Error::Configuration("执行计划无效".to_string()));
    }
    debug!("在设备 {} 上加载网络 {}", device_id, plan.network.name);
    Ok(Box::new(GridExecution { plan: plan.clone() }))
  }
}

struct GridExecution {
  plan: CompiledPlan,
}

impl GridExecution {
  fn apply_precision(&self, v: f32) -> f32 {
    match (self.plan.precision, self.plan.quantization) {
      (Precision::Fp32, _) => v,
      (Precision::Fp16, _) => f16::from_f32(v).to_f32(),
      (Precision::Int8, Some(table)) => table.fake_quantize(v),
      (Precision::Int8, None) => v,
    }
  }

  fn unit_scale(&self) -> f32 {
    match self.plan.network.variant {
      YoloVariant::V5 => 1.0,
      YoloVariant::X => 1.0 / 255.0,
    }
  }
}

impl Execution for GridExecution {
  fn forward(&mut self, input: &Tensor, batch: usize) -> Result<Vec<Vec<f32>>> {
    let net = &self.plan.network;
    if input.width() != net.input_width
      || input.height() != net.input_height
      || input.channels() != INPUT_CHANNELS
    {
      return Err(Error::Inference(format!(
        "输入张量形状 {}x{}x{} 与网络不符",
        input.channels(),
        input.height(),
        input.width()
      )));
    }
    if batch > self.plan.max_batch_size || batch > input.batch() {
      return Err(Error::Inference(format!(
        "批大小 {} 超出限制 {}",
        batch, self.plan.max_batch_size
      )));
    }

    let stride = net.stride;
    let (grid_w, grid_h) = (net.input_width / stride, net.input_height / stride);
    let cell_area = (stride * stride) as f32;
    let unit = self.unit_scale();
    let candidate_len = net.candidate_len();

    let mut outputs = Vec::with_capacity(batch);
    for ibatch in 0..batch {
      let slot = input.slot(ibatch)?;
      let mut output = vec![0.0f32; grid_w * grid_h * candidate_len];

      for gy in 0..grid_h {
        for gx in 0..grid_w {
          let mut activation = [0.0f32; INPUT_CHANNELS];
          for (c, act) in activation.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for y in gy * stride..(gy + 1) * stride {
              for x in gx * stride..(gx + 1) * stride {
                sum += self.apply_precision(slot[[c, y, x]]);
              }
            }
            let mean = sum / cell_area * unit;
            *act = ((mean - BACKGROUND_LEVEL) / (1.0 - BACKGROUND_LEVEL)).clamp(0.0, 1.0);
          }

          let objectness = activation.iter().copied().fold(0.0f32, f32::max);
          let base = (gy * grid_w + gx) * candidate_len;
          let cell = &mut output[base..base + candidate_len];
          cell[0] = (gx as f32 + 0.5) * stride as f32;
          cell[1] = (gy as f32 + 0.5) * stride as f32;
          cell[2] = stride as f32;
          cell[3] = stride as f32;
          cell[4] = self.apply_precision(objectness);
          if objectness > 0.0 {
            for (k, score) in cell[5..].iter_mut().enumerate() {
              if k < INPUT_CHANNELS {
                *score = self.apply_precision(activation[k] / objectness);
              }
            }
          }
        }
      }
      outputs.push(output);
    }

    Ok(outputs)
  }
}
