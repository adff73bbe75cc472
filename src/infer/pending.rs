// 该文件是 Dongfeng （东风） 项目的一部分。
// src/infer/pending.rs - 一次写入、多次读取的推理结果
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

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::model::DetectResult;

struct Cell {
  value: Mutex<Option<Result<DetectResult>>>,
  ready: Condvar,
}

impl Cell {
  fn lock(&self) -> MutexGuard<'_, Option<Result<DetectResult>>> {
    self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// 某一帧的推理结果
///
/// 克隆体共享同一个单元。读取会阻塞直到结果写入，之后每次读取得到相同的值。
#[derive(Clone)]
pub struct PendingResult {
  cell: Arc<Cell>,
  sequence: u64,
}

impl std::fmt::Debug for PendingResult {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingResult")
      .field("sequence", &self.sequence)
      .field("ready", &self.is_ready())
      .finish()
  }
}

impl PendingResult {
  /// 提交顺序号
  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn is_ready(&self) -> bool {
    self.cell.lock().is_some()
  }

  /// 阻塞直到结果可用
  pub fn get(&self) -> Result<DetectResult> {
    let mut guard = self.cell.lock();
    loop {
      if let Some(value) = guard.as_ref() {
        return value.clone();
      }
      guard = self
        .cell
        .ready
        .wait(guard)
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
  }

  /// 最多等待 `timeout`，超时返回 `None`
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<DetectResult>> {
    let deadline = Instant::now() + timeout;
    let mut guard = self.cell.lock();
    loop {
      if let Some(value) = guard.as_ref() {
        return Some(value.clone());
      }
      let remaining = deadline.checked_duration_since(Instant::now())?;
      guard = self
        .cell
        .ready
        .wait_timeout(guard, remaining)
        .map(|(guard, _)| guard)
        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
    }
  }
}

/// 结果的写入端，只能写一次
///
/// 未写入就被丢弃时，结果被置为失败，等待者不会永远阻塞。
pub(crate) struct Promise {
  cell: Option<Arc<Cell>>,
  sequence: u64,
}

impl Promise {
  pub(crate) fn sequence(&self) -> u64 {
    self.sequence
  }

  pub(crate) fn set(mut self, value: Result<DetectResult>) {
    if let Some(cell) = self.cell.take() {
      fulfil(&cell, value);
    }
  }
}

impl Drop for Promise {
  fn drop(&mut self) {
    if let Some(cell) = self.cell.take() {
      fulfil(
        &cell,
        Err(Error::Inference(format!(
          "第 {} 帧的结果在写入前被丢弃",
          self.sequence
        ))),
      );
    }
  }
}

fn fulfil(cell: &Cell, value: Result<DetectResult>) {
  let mut guard = cell.lock();
  if guard.is_none() {
    *guard = Some(value);
    cell.ready.notify_all();
  }
}

pub(crate) fn pending_pair(sequence: u64) -> (Promise, PendingResult) {
  let cell = Arc::new(Cell {
    value: Mutex::new(None),
    ready: Condvar::new(),
  });
  (
    Promise {
      cell: Some(cell.clone()),
      sequence,
    },
    PendingResult { cell, sequence },
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::DetectedObject;

  fn one_box() -> DetectResult {
    DetectResult::from(vec![DetectedObject {
      left: 1.0,
      top: 2.0,
      right: 3.0,
      bottom: 4.0,
      confidence: 0.9,
      class_label: 7,
    }])
  }

  #[test]
  fn value_is_readable_many_times() {
    let (promise, pending) = pending_pair(3);
    let other = pending.clone();
    assert!(!pending.is_ready());
    promise.set(Ok(one_box()));

    assert_eq!(pending.get().unwrap(), one_box());
    assert_eq!(pending.get().unwrap(), one_box());
    assert_eq!(other.get().unwrap(), one_box());
    assert_eq!(other.sequence(), 3);
  }

  #[test]
  fn get_blocks_until_another_thread_sets() {
    let (promise, pending) = pending_pair(0);
    let handle = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      promise.set(Ok(DetectResult::default()));
    });
    assert!(pending.get().unwrap().is_empty());
    handle.join().unwrap();
  }

  #[test]
  fn dropped_promise_resolves_to_failure() {
    let (promise, pending) = pending_pair(5);
    drop(promise);
    assert!(matches!(pending.get(), Err(Error::Inference(_))));
  }

  #[test]
  fn wait_timeout_expires_without_value() {
    let (_promise, pending) = pending_pair(0);
    assert!(pending.wait_timeout(Duration::from_millis(10)).is_none());
  }
}
