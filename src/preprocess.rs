// 该文件是 Dongfeng （东风） 项目的一部分。
// src/preprocess.rs - 帧预处理
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

//! # 帧预处理
//!
//! [`image_to_tensor`] 把一帧图像写入输入张量的某个批次位置：
//! 居中 letterbox 缩放、双线性采样、填充值 114，然后按网络变体做通道顺序和数值归一化。
//!
//! 主机帧先上传到设备，设备上的 NV12 帧先在设备上转换为 BGR，
//! 之后两条路径共用同一个仿射采样过程，所以同一内容的两种帧得到完全相同的张量。

use tracing::trace;

use crate::device::{DeviceBuffer, DevicePtr, ExecutionStream};
use crate::error::{Error, Result};
use crate::frame::{DeviceFrame, Frame, HostImage, nv12_pixel_to_bgr};
use crate::model::YoloVariant;
use crate::tensor::Tensor;

const PAD_VALUE: f32 = 114.0;

/// 2x3 仿射矩阵
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix {
  /// 原图到网络输入
  pub i2d: [f32; 6],
  /// 网络输入到原图
  pub d2i: [f32; 6],
}

impl AffineMatrix {
  /// 居中等比缩放
  pub fn letterbox(src: (usize, usize), dst: (usize, usize)) -> Self {
    let (src_w, src_h) = (src.0 as f32, src.1 as f32);
    let (dst_w, dst_h) = (dst.0 as f32, dst.1 as f32);
    let scale = (dst_w / src_w).min(dst_h / src_h);

    let i2d = [
      scale,
      0.0,
      -scale * src_w * 0.5 + dst_w * 0.5 + scale * 0.5 - 0.5,
      0.0,
      scale,
      -scale * src_h * 0.5 + dst_h * 0.5 + scale * 0.5 - 0.5,
    ];

    Self {
      i2d,
      d2i: invert(&i2d),
    }
  }

  /// 将网络输入坐标映射回原图
  pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
    let m = &self.d2i;
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
  }

  pub fn to_network(&self, x: f32, y: f32) -> (f32, f32) {
    let m = &self.i2d;
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
  }
}

fn invert(m: &[f32; 6]) -> [f32; 6] {
  let det = m[0] * m[4] - m[1] * m[3];
  let det = if det != 0.0 { 1.0 / det } else { 0.0 };
  let a11 = m[4] * det;
  let a12 = -m[1] * det;
  let a21 = -m[3] * det;
  let a22 = m[0] * det;
  let b1 = -a11 * m[2] - a12 * m[5];
  let b2 = -a21 * m[2] - a22 * m[5];
  [a11, a12, b1, a21, a22, b2]
}

/// 设备上的 BGR 图像
struct DeviceBgr {
  data: DevicePtr,
  width: usize,
  height: usize,
}

/// 主机图像上传到设备
fn upload_host(image: &HostImage, device_id: i32) -> DeviceBgr {
  DeviceBgr {
    data: DevicePtr::new(DeviceBuffer::upload(device_id, image.as_bytes()), 0),
    width: image.width(),
    height: image.height(),
  }
}

/// 在设备上将 NV12 转换为 BGR，读取前同步帧所属的流
fn convert_nv12(frame: &DeviceFrame, stream: &ExecutionStream) -> Result<DeviceBgr> {
  // 使用帧自己的流时 wait_for 不做任何事，仍要同步本流
  stream.wait_for(&frame.stream);
  stream.synchronize();

  let (width, height) = (frame.width, frame.height);
  let bgr = frame.data.with_slice(frame.byte_len(), |nv12| {
    let mut out = Vec::with_capacity(width * height * 3);
    for y in 0..height {
      for x in 0..width {
        out.extend_from_slice(&nv12_pixel_to_bgr(nv12, width, height, x, y));
      }
    }
    out
  })?;

  Ok(DeviceBgr {
    data: DevicePtr::new(DeviceBuffer::upload(frame.device_id, &bgr), 0),
    width,
    height,
  })
}

/// 把一帧写入 `tensor` 的第 `ibatch` 个位置，返回所用的仿射矩阵
///
/// 结果只取决于输入帧和目标位置。设备帧会在 `stream` 上等待帧自己的流，
/// 返回时帧数据已经被完全消费。
pub fn image_to_tensor(
  frame: &Frame,
  variant: YoloVariant,
  tensor: &mut Tensor,
  ibatch: usize,
  stream: Option<&ExecutionStream>,
) -> Result<AffineMatrix> {
  let source = match frame {
    Frame::Empty => return Err(Error::EmptyFrame),
    _ if frame.empty() => return Err(Error::EmptyFrame),
    Frame::Host(image) => {
      let device_id = stream.map(|s| s.device_id()).unwrap_or_default();
      upload_host(image, device_id)
    }
    Frame::DeviceYuv(device_frame) => {
      let stream = stream.unwrap_or(&device_frame.stream);
      convert_nv12(device_frame, stream)?
    }
  };

  let (dst_w, dst_h) = (tensor.width(), tensor.height());
  let affine = AffineMatrix::letterbox((source.width, source.height), (dst_w, dst_h));
  trace!(
    "预处理: {}x{} -> {}x{}, 批次位置 {}",
    source.width, source.height, dst_w, dst_h, ibatch
  );

  let mut slot = tensor.slot_mut(ibatch)?;
  source.data.with_slice(source.width * source.height * 3, |bgr| {
    for dy in 0..dst_h {
      for dx in 0..dst_w {
        let (sx, sy) = affine.to_source(dx as f32, dy as f32);
        let [b, g, r] = sample_bilinear(bgr, source.width, source.height, sx, sy);
        let channels = match variant {
          YoloVariant::V5 => [r / 255.0, g / 255.0, b / 255.0],
          YoloVariant::X => [b, g, r],
        };
        for (c, value) in channels.into_iter().enumerate() {
          slot[[c, dy, dx]] = value;
        }
      }
    }
  })?;

  Ok(affine)
}

fn sample_bilinear(bgr: &[u8], width: usize, height: usize, x: f32, y: f32) -> [f32; 3] {
  let (w, h) = (width as f32, height as f32);
  if x <= -1.0 || x >= w || y <= -1.0 || y >= h {
    return [PAD_VALUE; 3];
  }

  let x_low = x.floor();
  let y_low = y.floor();
  let lx = x - x_low;
  let ly = y - y_low;
  let hx = 1.0 - lx;
  let hy = 1.0 - ly;

  let fetch = |px: f32, py: f32| -> [f32; 3] {
    if px < 0.0 || py < 0.0 || px >= w || py >= h {
      return [PAD_VALUE; 3];
    }
    let idx = (py as usize * width + px as usize) * 3;
    [bgr[idx] as f32, bgr[idx + 1] as f32, bgr[idx + 2] as f32]
  };

  let v1 = fetch(x_low, y_low);
  let v2 = fetch(x_low + 1.0, y_low);
  let v3 = fetch(x_low, y_low + 1.0);
  let v4 = fetch(x_low + 1.0, y_low + 1.0);

  let (w1, w2, w3, w4) = (hy * hx, hy * lx, ly * hx, ly * lx);
  let mut out = [0.0f32; 3];
  for c in 0..3 {
    // 四舍五入到整数像素值
    out[c] = (w1 * v1[c] + w2 * v2[c] + w3 * v3[c] + w4 * v4[c]).round();
  }
  out
}
