// 该文件是 Dongfeng （东风） 项目的一部分。
// src/tensor.rs - NCHW 张量
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

use ndarray::{Array4, ArrayView3, ArrayViewMut3, Axis};

use crate::error::{Error, Result};

pub const INPUT_CHANNELS: usize = 3;

/// 批量 NCHW 浮点张量
///
/// 每个批次位置是一个 `[C, H, W]` 视图。
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  data: Array4<f32>,
}

impl Tensor {
  pub fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
    Self {
      data: Array4::zeros((batch, channels, height, width)),
    }
  }

  /// 网络输入张量，三通道
  pub fn input(batch: usize, height: usize, width: usize) -> Self {
    Self::new(batch, INPUT_CHANNELS, height, width)
  }

  pub fn batch(&self) -> usize {
    self.data.len_of(Axis(0))
  }

  pub fn channels(&self) -> usize {
    self.data.len_of(Axis(1))
  }

  pub fn height(&self) -> usize {
    self.data.len_of(Axis(2))
  }

  pub fn width(&self) -> usize {
    self.data.len_of(Axis(3))
  }

  pub fn slot_len(&self) -> usize {
    self.channels() * self.height() * self.width()
  }

  pub fn slot(&self, ibatch: usize) -> Result<ArrayView3<'_, f32>> {
    self.check_slot(ibatch)?;
    Ok(self.data.index_axis(Axis(0), ibatch))
  }

  pub fn slot_mut(&mut self, ibatch: usize) -> Result<ArrayViewMut3<'_, f32>> {
    self.check_slot(ibatch)?;
    Ok(self.data.index_axis_mut(Axis(0), ibatch))
  }

  /// 从另一个张量的某个批次位置复制数据
  pub fn copy_slot_from(&mut self, ibatch: usize, src: &Tensor, src_batch: usize) -> Result<()> {
    let source = src.slot(src_batch)?;
    let mut target = self.slot_mut(ibatch)?;
    if source.dim() != target.dim() {
      return Err(Error::Inference(format!(
        "张量形状不匹配: {:?} != {:?}",
        source.dim(),
        target.dim()
      )));
    }
    target.assign(&source);
    Ok(())
  }

  pub fn as_array(&self) -> &Array4<f32> {
    &self.data
  }

  fn check_slot(&self, ibatch: usize) -> Result<()> {
    if ibatch >= self.batch() {
      return Err(Error::Inference(format!(
        "批次索引 {} 超出张量批大小 {}",
        ibatch,
        self.batch()
      )));
    }
    Ok(())
  }
}
