// 该文件是 Dongfeng （东风） 项目的一部分。
// src/engine/calibration.rs - Int8 校准数据
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

use crate::error::Result;
use crate::frame::Frame;

/// 可重启的有限校准批次序列
///
/// 构建引擎时先调用 [`reset`](CalibrationSource::reset)，
/// 然后反复调用 [`next_batch`](CalibrationSource::next_batch) 直到返回 `None`。
pub trait CalibrationSource {
  fn reset(&mut self) -> Result<()>;
  fn next_batch(&mut self) -> Result<Option<Vec<Frame>>>;

  /// 总批次数，未知时为 `None`
  fn len_hint(&self) -> Option<usize> {
    None
  }
}

/// 内存中的校准帧
#[derive(Debug, Clone)]
pub struct FrameCalibration {
  frames: Vec<Frame>,
  batch_size: usize,
  cursor: usize,
}

impl FrameCalibration {
  pub fn new(frames: Vec<Frame>, batch_size: usize) -> Self {
    Self {
      frames,
      batch_size: batch_size.max(1),
      cursor: 0,
    }
  }
}

impl CalibrationSource for FrameCalibration {
  fn reset(&mut self) -> Result<()> {
    self.cursor = 0;
    Ok(())
  }

  fn next_batch(&mut self) -> Result<Option<Vec<Frame>>> {
    if self.cursor >= self.frames.len() {
      return Ok(None);
    }
    let end = (self.cursor + self.batch_size).min(self.frames.len());
    let batch = self.frames[self.cursor..end].to_vec();
    self.cursor = end;
    Ok(Some(batch))
  }

  fn len_hint(&self) -> Option<usize> {
    Some(self.frames.len().div_ceil(self.batch_size))
  }
}

#[cfg(feature = "read_image_file")]
mod image_folder {
  use std::path::{Path, PathBuf};

  use image::ImageReader;
  use tracing::debug;

  use super::CalibrationSource;
  use crate::error::{Error, Result};
  use crate::frame::{Frame, HostImage};
  use crate::input::list_image_files;

  /// 图像目录校准数据，按文件名排序分批读取
  #[derive(Debug, Clone)]
  pub struct ImageFolderCalibration {
    files: Vec<PathBuf>,
    batch_size: usize,
    cursor: usize,
  }

  impl ImageFolderCalibration {
    pub fn new(dir: &Path, batch_size: usize) -> Result<Self> {
      let files = list_image_files(dir)?;
      if files.is_empty() {
        return Err(Error::Calibration(format!(
          "校准目录中没有图像: {}",
          dir.display()
        )));
      }
      debug!("校准图像数量: {}", files.len());
      Ok(Self {
        files,
        batch_size: batch_size.max(1),
        cursor: 0,
      })
    }
  }

  impl CalibrationSource for ImageFolderCalibration {
    fn reset(&mut self) -> Result<()> {
      self.cursor = 0;
      Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Vec<Frame>>> {
      if self.cursor >= self.files.len() {
        return Ok(None);
      }
      let end = (self.cursor + self.batch_size).min(self.files.len());
      let mut batch = Vec::with_capacity(end - self.cursor);
      for path in &self.files[self.cursor..end] {
        let image = ImageReader::open(path)?.decode()?.to_rgb8();
        batch.push(Frame::Host(HostImage::from(image)));
      }
      self.cursor = end;
      Ok(Some(batch))
    }

    fn len_hint(&self) -> Option<usize> {
      Some(self.files.len().div_ceil(self.batch_size))
    }
  }
}

#[cfg(feature = "read_image_file")]
pub use self::image_folder::ImageFolderCalibration;
