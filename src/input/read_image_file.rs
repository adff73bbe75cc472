// 该文件是 Dongfeng （东风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::{Path, PathBuf};

use image::ImageReader;
use tracing::{debug, error};
use url::Url;

use crate::error::{Error, Result};
use crate::frame::{Frame, HostImage};
use crate::{FromUrl, FromUrlWithScheme};

const READ_IMAGE_FILE_SCHEME: &str = "image";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

fn is_image_file(path: &Path) -> bool {
  path.is_file()
    && path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| {
        IMAGE_EXTENSIONS
          .iter()
          .any(|known| known.eq_ignore_ascii_case(ext))
      })
      .unwrap_or(false)
}

/// 列出目录中的图像文件，按文件名排序
pub fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
  let entries = std::fs::read_dir(dir)
    .map_err(|e| Error::Source(format!("无法读取目录 {}: {}", dir.display(), e)))?;
  let mut files = Vec::new();
  for entry in entries {
    let path = entry?.path();
    if is_image_file(&path) {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}

/// 软解码输入：单个图像文件或一个图像目录
///
/// 逐个产出 BGR 主机帧，读取失败的文件产出 [`Error::Source`]。
#[derive(Debug, Clone)]
pub struct ImageFileInput {
  files: Vec<PathBuf>,
  cursor: usize,
}

impl ImageFileInput {
  pub fn open(path: &Path) -> Result<Self> {
    let files = if path.is_dir() {
      list_image_files(path)?
    } else if path.is_file() {
      vec![path.to_path_buf()]
    } else {
      return Err(Error::Source(format!("输入路径不存在: {}", path.display())));
    };
    debug!("图像输入: {} 个文件", files.len());
    Ok(Self { files, cursor: 0 })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  pub fn files(&self) -> &[PathBuf] {
    &self.files
  }
}

fn read_frame(path: &Path) -> Result<Frame> {
  let image = ImageReader::open(path)
    .map_err(|e| Error::Source(format!("无法打开图像文件 {}: {}", path.display(), e)))?
    .decode()
    .map_err(|e| Error::Source(format!("无法解码图像文件 {}: {}", path.display(), e)))?
    .to_rgb8();
  Ok(Frame::Host(HostImage::from(image)))
}

impl Iterator for ImageFileInput {
  type Item = Result<Frame>;

  fn next(&mut self) -> Option<Self::Item> {
    let path = self.files.get(self.cursor)?;
    self.cursor += 1;
    Some(read_frame(path))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let remaining = self.files.len() - self.cursor;
    (remaining, Some(remaining))
  }
}

impl FromUrl for ImageFileInput {
  type Error = Error;

  fn from_url(url: &Url) -> Result<Self> {
    if url.scheme() != READ_IMAGE_FILE_SCHEME {
      error!(
        "URI scheme 不匹配: 期望 '{}', 实际 '{}'",
        READ_IMAGE_FILE_SCHEME,
        url.scheme()
      );
      return Err(Error::Configuration(format!(
        "图像输入必须使用 {} 方案",
        READ_IMAGE_FILE_SCHEME
      )));
    }
    let path = urlencoding::decode(url.path())
      .map_err(|e| Error::Configuration(format!("输入路径编码无效: {}", e)))?;
    Self::open(Path::new(path.as_ref()))
  }
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = READ_IMAGE_FILE_SCHEME;
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  #[test]
  fn directory_is_read_in_sorted_order() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::from_pixel(4, 2, Rgb([255, 0, 0]))
      .save(dir.path().join("b.png"))
      .unwrap();
    RgbImage::from_pixel(3, 3, Rgb([0, 0, 255]))
      .save(dir.path().join("a.png"))
      .unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

    let input = ImageFileInput::open(dir.path()).unwrap();
    assert_eq!(input.len(), 2);
    let frames: Vec<Frame> = input.map(|f| f.unwrap()).collect();

    let Frame::Host(first) = &frames[0] else {
      panic!("应为主机帧");
    };
    assert_eq!((first.width(), first.height()), (3, 3));
    assert_eq!(first.pixel(0, 0), [255, 0, 0]);

    let Frame::Host(second) = &frames[1] else {
      panic!("应为主机帧");
    };
    assert_eq!(second.pixel(1, 1), [0, 0, 255]);
  }

  #[test]
  fn corrupt_file_is_a_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.png");
    std::fs::write(&path, b"not a png").unwrap();
    let mut input = ImageFileInput::open(&path).unwrap();
    assert!(matches!(input.next(), Some(Err(Error::Source(_)))));
    assert!(input.next().is_none());
  }

  #[test]
  fn url_scheme_is_checked() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::from_directory_path(dir.path()).unwrap();
    assert!(ImageFileInput::from_url(&url).is_err());

    let url = Url::parse(&format!("image://{}", dir.path().display())).unwrap();
    let input = ImageFileInput::from_url(&url).unwrap();
    assert!(input.is_empty());
  }
}
