// 该文件是 Dongfeng （东风） 项目的一部分。
// src/error.rs - 错误定义
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

use thiserror::Error;

/// 流水线统一错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
  /// 模型文件缺失或无效、精度与校准数据组合非法
  #[error("配置错误: {0}")]
  Configuration(String),
  /// 校准数据不足或格式错误
  #[error("校准错误: {0}")]
  Calibration(String),
  /// 加速器拒绝编译后的计算图
  #[error("引擎构建错误: {0}")]
  Build(String),
  /// 推理服务已关闭，不再接受提交
  #[error("推理服务已关闭")]
  ServiceClosed,
  /// 解码、解复用或文件读取失败
  #[error("输入源错误: {0}")]
  Source(String),
  /// 提交了空帧
  #[error("空帧不能提交推理")]
  EmptyFrame,
  /// 单帧推理失败
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("I/O 错误: {0}")]
  Io(String),
}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Self {
    Error::Io(err.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Error::Configuration(format!("JSON 解析失败: {}", err))
  }
}

#[cfg(feature = "read_image_file")]
impl From<image::ImageError> for Error {
  fn from(err: image::ImageError) -> Self {
    Error::Source(format!("图像加载失败: {}", err))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
