// 该文件是 Dongfeng （东风） 项目的一部分。
// src/device.rs - 设备内存与执行流
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

//! # 设备抽象
//!
//! 本模块以显式的设备号描述设备内存与执行流，不依赖进程级的“当前设备”状态。
//!
//! - [`DeviceBuffer`]：某个设备上的一段内存
//! - [`DevicePtr`]：指向设备内存的非拥有视图，持有者不负责释放
//! - [`ExecutionStream`]：有序的异步工作队列，提交的工作只有在
//!   [`ExecutionStream::synchronize`] 之后才对读者可见
//!
//! 解码器在自己的流上写入帧数据，推理服务在消费帧之前必须同步该流。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::trace;

use crate::error::{Error, Result};

pub type DeviceId = i32;

/// 设备内存
#[derive(Debug)]
pub struct DeviceBuffer {
  device_id: DeviceId,
  data: RwLock<Box<[u8]>>,
}

impl DeviceBuffer {
  pub fn alloc(device_id: DeviceId, size: usize) -> Arc<Self> {
    Arc::new(Self {
      device_id,
      data: RwLock::new(vec![0u8; size].into_boxed_slice()),
    })
  }

  /// 将主机数据上传到新分配的设备内存
  pub fn upload(device_id: DeviceId, host: &[u8]) -> Arc<Self> {
    Arc::new(Self {
      device_id,
      data: RwLock::new(host.to_vec().into_boxed_slice()),
    })
  }

  pub fn device_id(&self) -> DeviceId {
    self.device_id
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
    self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
    self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// 非拥有的设备指针
#[derive(Debug, Clone)]
pub struct DevicePtr {
  buffer: Arc<DeviceBuffer>,
  offset: usize,
}

impl DevicePtr {
  pub fn new(buffer: Arc<DeviceBuffer>, offset: usize) -> Self {
    Self { buffer, offset }
  }

  pub fn device_id(&self) -> DeviceId {
    self.buffer.device_id()
  }

  pub fn offset(&self) -> usize {
    self.offset
  }

  /// 指针之后可访问的字节数
  pub fn available(&self) -> usize {
    self.buffer.len().saturating_sub(self.offset)
  }

  pub fn buffer(&self) -> &Arc<DeviceBuffer> {
    &self.buffer
  }

  /// 以只读方式访问 `[offset, offset + len)`
  pub fn with_slice<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
    let data = self.buffer.read();
    let end = self
      .offset
      .checked_add(len)
      .filter(|&end| end <= data.len())
      .ok_or_else(|| {
        Error::Inference(format!(
          "设备内存越界: 偏移 {} 长度 {} 超出缓冲区大小 {}",
          self.offset,
          len,
          data.len()
        ))
      })?;
    Ok(f(&data[self.offset..end]))
  }

  pub fn is_same(&self, other: &DevicePtr) -> bool {
    Arc::ptr_eq(&self.buffer, &other.buffer) && self.offset == other.offset
  }
}

type StreamOp = Box<dyn FnOnce() + Send>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct StreamInner {
  id: u64,
  device_id: DeviceId,
  pending: Mutex<VecDeque<StreamOp>>,
  exec: Mutex<()>,
  completed: AtomicU64,
}

/// 执行流
///
/// 句柄可以克隆，克隆体共享同一个工作队列。
#[derive(Clone)]
pub struct ExecutionStream {
  inner: Arc<StreamInner>,
}

impl std::fmt::Debug for ExecutionStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecutionStream")
      .field("id", &self.inner.id)
      .field("device_id", &self.inner.device_id)
      .field("pending", &self.pending())
      .finish()
  }
}

impl ExecutionStream {
  pub fn new(device_id: DeviceId) -> Self {
    Self {
      inner: Arc::new(StreamInner {
        id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
        device_id,
        pending: Mutex::new(VecDeque::new()),
        exec: Mutex::new(()),
        completed: AtomicU64::new(0),
      }),
    }
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn device_id(&self) -> DeviceId {
    self.inner.device_id
  }

  /// 在流上排队一项设备工作
  pub fn enqueue(&self, op: impl FnOnce() + Send + 'static) {
    self.queue().push_back(Box::new(op));
  }

  pub fn pending(&self) -> usize {
    self.queue().len()
  }

  /// 已完成的工作数量
  pub fn completed(&self) -> u64 {
    self.inner.completed.load(Ordering::Acquire)
  }

  /// 阻塞直到流上已排队的工作全部完成
  pub fn synchronize(&self) {
    // 持有执行锁直到队列清空，并发的同步者不会在工作完成前返回
    let _exec = self
      .inner
      .exec
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    loop {
      // 逐个取出，工作本身可以继续向本流排队
      let op = self.queue().pop_front();
      match op {
        Some(op) => {
          op();
          self.inner.completed.fetch_add(1, Ordering::AcqRel);
        }
        None => break,
      }
    }
    trace!("执行流 {} 已同步", self.inner.id);
  }

  /// 使本流等待另一条流上已排队的工作
  pub fn wait_for(&self, other: &ExecutionStream) {
    if self.inner.id != other.inner.id {
      other.synchronize();
    }
  }

  fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<StreamOp>> {
    self
      .inner
      .pending
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
