// 该文件是 Dongfeng （东风） 项目的一部分。
// src/input/decoder.rs - 解复用与硬件解码接口
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
use crate::error::Result;
use crate::frame::DeviceFrame;

/// 压缩数据包，空包表示流结束
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
  pub data: Vec<u8>,
  pub pts: i64,
}

impl Packet {
  pub fn new(data: Vec<u8>, pts: i64) -> Self {
    Self { data, pts }
  }

  /// 结束包
  pub fn end() -> Self {
    Self::default()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// 解复用器
pub trait PacketSource {
  /// 解码器初始化所需的头部数据
  fn extra_data(&self) -> &[u8];

  /// 读取下一个数据包，`None` 表示没有更多数据
  fn demux(&mut self) -> Result<Option<Packet>>;
}

/// 解码器输出的一帧
#[derive(Debug, Clone)]
pub struct DecodedFrame {
  pub ptr: DevicePtr,
  pub pts: i64,
  pub index: u64,
}

/// 硬件解码器
///
/// 解码结果写在设备内存中，写入工作排在 [`stream`](HardwareDecoder::stream) 上。
/// 解码器会在之后的解码中复用缓冲区，消费者必须在那之前读取完帧数据。
pub trait HardwareDecoder {
  /// 送入一个数据包，返回可以取出的帧数。空数据表示冲刷
  fn decode(&mut self, data: &[u8], pts: i64) -> Result<usize>;

  fn get_frame(&mut self) -> Option<DecodedFrame>;

  fn width(&self) -> usize;

  fn height(&self) -> usize;

  fn device_id(&self) -> DeviceId;

  fn stream(&self) -> &ExecutionStream;

  /// 把解码结果包装为设备帧
  fn device_frame(&self, decoded: &DecodedFrame) -> DeviceFrame {
    DeviceFrame::new(
      decoded.ptr.clone(),
      self.width(),
      self.height(),
      self.device_id(),
      self.stream().clone(),
    )
  }
}
