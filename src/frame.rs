// 该文件是 Dongfeng （东风） 项目的一部分。
// src/frame.rs - 帧定义
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

use crate::device::{DeviceId, DevicePtr, ExecutionStream};
use crate::error::{Error, Result};

const BGR_CHANNELS: usize = 3;

/// 帧的存储位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
  HostImage,
  DeviceYuv,
}

/// 主机内存中的 BGR 图像，按行紧密排列
#[derive(Debug, Clone, PartialEq)]
pub struct HostImage {
  width: usize,
  height: usize,
  data: Box<[u8]>,
}

impl HostImage {
  pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self> {
    if data.len() != BGR_CHANNELS * width * height {
      return Err(Error::Source(format!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        BGR_CHANNELS * width * height,
        data.len()
      )));
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 纯色图像
  pub fn filled(width: usize, height: usize, bgr: [u8; 3]) -> Self {
    let data = bgr.repeat(width * height).into_boxed_slice();
    Self {
      width,
      height,
      data,
    }
  }

  /// 按 BT.601 将 NV12 转换为 BGR
  pub fn from_nv12(width: usize, height: usize, nv12: &[u8]) -> Result<Self> {
    if nv12.len() < nv12_size(width, height) {
      return Err(Error::Source(format!(
        "NV12 数据长度不足: 需要 {}, 实际 {}",
        nv12_size(width, height),
        nv12.len()
      )));
    }

    let mut data = Vec::with_capacity(BGR_CHANNELS * width * height);
    for y in 0..height {
      for x in 0..width {
        data.extend_from_slice(&nv12_pixel_to_bgr(nv12, width, height, x, y));
      }
    }

    Self::new(width, height, data)
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn channels(&self) -> usize {
    BGR_CHANNELS
  }

  pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
    let idx = (y * self.width + x) * BGR_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }

  pub fn put_pixel(&mut self, x: usize, y: usize, bgr: [u8; 3]) {
    let idx = (y * self.width + x) * BGR_CHANNELS;
    self.data[idx..idx + BGR_CHANNELS].copy_from_slice(&bgr);
  }

  /// 填充矩形区域，超出图像的部分被忽略
  pub fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, bgr: [u8; 3]) {
    for yy in y..(y + h).min(self.height) {
      for xx in x..(x + w).min(self.width) {
        self.put_pixel(xx, yy, bgr);
      }
    }
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for HostImage {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

#[cfg(feature = "read_image_file")]
impl From<image::RgbImage> for HostImage {
  fn from(image: image::RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let mut data = Vec::with_capacity(BGR_CHANNELS * (width * height) as usize);
    for pixel in image.pixels() {
      data.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }
    Self {
      width: width as usize,
      height: height as usize,
      data: data.into_boxed_slice(),
    }
  }
}

/// NV12 图像所需字节数
pub fn nv12_size(width: usize, height: usize) -> usize {
  width * height + width.div_ceil(2) * 2 * height.div_ceil(2)
}

/// 读取 NV12 平面中 (x, y) 处的像素并转换为 BGR
pub(crate) fn nv12_pixel_to_bgr(
  nv12: &[u8],
  width: usize,
  height: usize,
  x: usize,
  y: usize,
) -> [u8; 3] {
  let luma = nv12[y * width + x] as f32;
  let chroma_row = width.div_ceil(2) * 2;
  let uv = width * height + (y / 2) * chroma_row + (x / 2) * 2;
  let u = nv12[uv] as f32 - 128.0;
  let v = nv12[uv + 1] as f32 - 128.0;

  let r = luma + 1.402 * v;
  let g = luma - 0.344_136 * u - 0.714_136 * v;
  let b = luma + 1.772 * u;
  [saturate(b), saturate(g), saturate(r)]
}

fn saturate(v: f32) -> u8 {
  v.round().clamp(0.0, 255.0) as u8
}

/// 设备内存中的 NV12 帧
///
/// 指针不归帧所有：只有在解码器保证缓冲区不被复用的期间内才有效，
/// 读取之前必须同步 `stream`。
#[derive(Debug, Clone)]
pub struct DeviceFrame {
  pub data: DevicePtr,
  pub width: usize,
  pub height: usize,
  pub device_id: DeviceId,
  pub stream: ExecutionStream,
}

impl DeviceFrame {
  pub fn new(
    data: DevicePtr,
    width: usize,
    height: usize,
    device_id: DeviceId,
    stream: ExecutionStream,
  ) -> Self {
    Self {
      data,
      width,
      height,
      device_id,
      stream,
    }
  }

  pub fn byte_len(&self) -> usize {
    nv12_size(self.width, self.height)
  }
}

/// 一帧待推理的图像
#[derive(Debug, Clone, Default)]
pub enum Frame {
  /// 没有帧
  #[default]
  Empty,
  Host(HostImage),
  DeviceYuv(DeviceFrame),
}

impl Frame {
  pub fn kind(&self) -> Option<FrameKind> {
    match self {
      Frame::Empty => None,
      Frame::Host(_) => Some(FrameKind::HostImage),
      Frame::DeviceYuv(_) => Some(FrameKind::DeviceYuv),
    }
  }

  pub fn width(&self) -> usize {
    match self {
      Frame::Empty => 0,
      Frame::Host(image) => image.width(),
      Frame::DeviceYuv(frame) => frame.width,
    }
  }

  pub fn height(&self) -> usize {
    match self {
      Frame::Empty => 0,
      Frame::Host(image) => image.height(),
      Frame::DeviceYuv(frame) => frame.height,
    }
  }

  pub fn empty(&self) -> bool {
    match self {
      Frame::Empty => true,
      Frame::Host(image) => image.width() == 0 || image.height() == 0,
      Frame::DeviceYuv(frame) => {
        frame.width == 0 || frame.height == 0 || frame.data.buffer().is_empty()
      }
    }
  }
}

impl From<HostImage> for Frame {
  fn from(image: HostImage) -> Self {
    Frame::Host(image)
  }
}

impl From<DeviceFrame> for Frame {
  fn from(frame: DeviceFrame) -> Self {
    Frame::DeviceYuv(frame)
  }
}
