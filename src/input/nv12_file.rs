// 该文件是 Dongfeng （东风） 项目的一部分。
// src/input/nv12_file.rs - 原始 NV12 文件与软件模拟的硬件解码器
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

//! 文件格式：12 字节头部（`NV12`、宽、高，小端 u32），随后是连续的 NV12 帧。
//! 头部同时作为解码器的 extra data。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace};

use super::decoder::{DecodedFrame, HardwareDecoder, Packet, PacketSource};
use crate::device::{DeviceBuffer, DeviceId, DevicePtr, ExecutionStream};
use crate::error::{Error, Result};
use crate::frame::nv12_size;

const NV12_MAGIC: &[u8; 4] = b"NV12";
const HEADER_LEN: usize = 12;

/// 解码器复用的设备缓冲区数量
pub const DEFAULT_RING_SIZE: usize = 4;

fn encode_header(width: usize, height: usize) -> Result<[u8; HEADER_LEN]> {
  let (w, h) = (
    u32::try_from(width).map_err(|_| Error::Source(format!("宽度过大: {}", width)))?,
    u32::try_from(height).map_err(|_| Error::Source(format!("高度过大: {}", height)))?,
  );
  let mut header = [0u8; HEADER_LEN];
  header[..4].copy_from_slice(NV12_MAGIC);
  header[4..8].copy_from_slice(&w.to_le_bytes());
  header[8..].copy_from_slice(&h.to_le_bytes());
  Ok(header)
}

fn decode_header(header: &[u8]) -> Result<(usize, usize)> {
  if header.len() != HEADER_LEN || &header[..4] != NV12_MAGIC {
    return Err(Error::Source("不是 NV12 文件头".to_string()));
  }
  let width = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
  let height = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
  if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
    return Err(Error::Source(format!("无效的 NV12 尺寸: {}x{}", width, height)));
  }
  Ok((width, height))
}

/// 原始 NV12 文件的解复用器，每帧一个数据包
pub struct Nv12File {
  reader: Box<dyn Read + Send>,
  header: [u8; HEADER_LEN],
  width: usize,
  height: usize,
  next_pts: i64,
  finished: bool,
}

impl std::fmt::Debug for Nv12File {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Nv12File")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("next_pts", &self.next_pts)
      .finish()
  }
}

impl Nv12File {
  pub fn open(path: &Path) -> Result<Self> {
    let file = File::open(path)
      .map_err(|e| Error::Source(format!("无法打开 {}: {}", path.display(), e)))?;
    debug!("打开 NV12 文件: {}", path.display());
    Self::from_reader(BufReader::new(file))
  }

  pub fn from_reader(mut reader: impl Read + Send + 'static) -> Result<Self> {
    let mut header = [0u8; HEADER_LEN];
    reader
      .read_exact(&mut header)
      .map_err(|e| Error::Source(format!("无法读取 NV12 文件头: {}", e)))?;
    let (width, height) = decode_header(&header)?;
    Ok(Self {
      reader: Box::new(reader),
      header,
      width,
      height,
      next_pts: 0,
      finished: false,
    })
  }

  /// 写出 NV12 文件，每一帧的长度必须等于 `nv12_size(width, height)`
  pub fn write<F: AsRef<[u8]>>(path: &Path, width: usize, height: usize, frames: &[F]) -> Result<()> {
    let header = encode_header(width, height)?;
    decode_header(&header)?;
    let frame_size = nv12_size(width, height);

    let mut file = std::io::BufWriter::new(File::create(path)?);
    file.write_all(&header)?;
    for (index, frame) in frames.iter().enumerate() {
      let frame = frame.as_ref();
      if frame.len() != frame_size {
        return Err(Error::Source(format!(
          "第 {} 帧大小 {} 与 NV12 帧大小 {} 不符",
          index,
          frame.len(),
          frame_size
        )));
      }
      file.write_all(frame)?;
    }
    file.flush()?;
    Ok(())
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn frame_size(&self) -> usize {
    nv12_size(self.width, self.height)
  }
}

impl PacketSource for Nv12File {
  fn extra_data(&self) -> &[u8] {
    &self.header
  }

  fn demux(&mut self) -> Result<Option<Packet>> {
    if self.finished {
      return Ok(None);
    }

    let mut data = vec![0u8; self.frame_size()];
    let mut filled = 0;
    while filled < data.len() {
      match self.reader.read(&mut data[filled..]) {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
        Err(e) => return Err(Error::Source(format!("读取数据包失败: {}", e))),
      }
    }

    if filled == 0 {
      self.finished = true;
      return Ok(Some(Packet::end()));
    }
    if filled < data.len() {
      self.finished = true;
      return Err(Error::Source(format!(
        "NV12 文件被截断: 第 {} 帧只有 {} 字节",
        self.next_pts, filled
      )));
    }

    let pts = self.next_pts;
    self.next_pts += 1;
    Ok(Some(Packet::new(data, pts)))
  }
}

/// 软件模拟的硬件解码器
///
/// 每个数据包在解码器自己的执行流上上传到环形缓冲区中的下一块设备内存。
pub struct Nv12Decoder {
  width: usize,
  height: usize,
  device_id: DeviceId,
  stream: ExecutionStream,
  ring: Vec<Arc<DeviceBuffer>>,
  next_slot: usize,
  ready: VecDeque<DecodedFrame>,
  decoded: u64,
}

impl Nv12Decoder {
  pub fn new(width: usize, height: usize, device_id: DeviceId, ring_size: usize) -> Self {
    let frame_size = nv12_size(width, height);
    let ring = (0..ring_size.max(1))
      .map(|_| DeviceBuffer::alloc(device_id, frame_size))
      .collect();
    Self {
      width,
      height,
      device_id,
      stream: ExecutionStream::new(device_id),
      ring,
      next_slot: 0,
      ready: VecDeque::new(),
      decoded: 0,
    }
  }

  /// 按解复用器的尺寸创建解码器
  pub fn for_source(source: &Nv12File, device_id: DeviceId) -> Self {
    Self::new(source.width(), source.height(), device_id, DEFAULT_RING_SIZE)
  }

  pub fn ring_size(&self) -> usize {
    self.ring.len()
  }

  pub fn decoded_frames(&self) -> u64 {
    self.decoded
  }
}

impl HardwareDecoder for Nv12Decoder {
  fn decode(&mut self, data: &[u8], pts: i64) -> Result<usize> {
    if data.is_empty() {
      trace!("冲刷解码器");
      return Ok(self.ready.len());
    }

    if data.len() == HEADER_LEN && data.starts_with(NV12_MAGIC) {
      let (width, height) = decode_header(data)?;
      if (width, height) != (self.width, self.height) {
        return Err(Error::Source(format!(
          "流尺寸 {}x{} 与解码器 {}x{} 不符",
          width, height, self.width, self.height
        )));
      }
      debug!("解码器已配置: {}x{}", width, height);
      return Ok(0);
    }

    let frame_size = nv12_size(self.width, self.height);
    if data.len() != frame_size {
      return Err(Error::Source(format!(
        "数据包大小 {} 与帧大小 {} 不符",
        data.len(),
        frame_size
      )));
    }

    let buffer = self.ring[self.next_slot].clone();
    self.next_slot = (self.next_slot + 1) % self.ring.len();

    let target = buffer.clone();
    let payload = data.to_vec();
    self
      .stream
      .enqueue(move || target.write().copy_from_slice(&payload));

    self.ready.push_back(DecodedFrame {
      ptr: DevicePtr::new(buffer, 0),
      pts,
      index: self.decoded,
    });
    self.decoded += 1;
    Ok(1)
  }

  fn get_frame(&mut self) -> Option<DecodedFrame> {
    self.ready.pop_front()
  }

  fn width(&self) -> usize {
    self.width
  }

  fn height(&self) -> usize {
    self.height
  }

  fn device_id(&self) -> DeviceId {
    self.device_id
  }

  fn stream(&self) -> &ExecutionStream {
    &self.stream
  }
}
