// 该文件是 Dongfeng （东风） 项目的一部分。
// src/bin/build_engine.rs - 引擎编译工具
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dongfeng::{
  accelerator::CpuAccelerator,
  engine::{CalibrationSource, EngineBuilder, ImageFolderCalibration, Precision},
};

/// 把模型源文件编译为引擎文件，已存在时直接复用
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型源文件（JSON 网络描述）
  #[arg(long, value_name = "MODEL")]
  pub model: PathBuf,
  /// 精度：FP32 / FP16 / INT8
  #[arg(long, default_value = "FP32", value_name = "MODE")]
  pub precision: String,
  /// 最大批大小
  #[arg(long, default_value_t = 16, value_name = "BATCH")]
  pub max_batch: usize,
  /// 引擎文件目录，默认与模型源文件相同
  #[arg(long, value_name = "DIR")]
  pub artifact_dir: Option<PathBuf>,
  #[arg(long, default_value_t = 0, value_name = "DEVICE")]
  pub device: i32,
  /// INT8 校准图像目录
  #[arg(long, value_name = "DIR")]
  pub calibration: Option<PathBuf>,
  /// 每个校准批次的图像数
  #[arg(long, default_value_t = 16, value_name = "BATCH")]
  pub calibration_batch: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let precision = Precision::parse(&args.precision)
    .with_context(|| format!("未知的精度: {}", args.precision))?;
  info!("模型文件路径: {}", args.model.display());
  info!("精度: {}, 最大批大小: {}", precision.mode_string(), args.max_batch);

  let mut builder = EngineBuilder::new(Arc::new(CpuAccelerator::new())).device_id(args.device);
  if let Some(dir) = &args.artifact_dir {
    builder = builder.artifact_dir(dir);
  }

  let mut calibration = args
    .calibration
    .as_deref()
    .map(|dir| ImageFolderCalibration::new(dir, args.calibration_batch))
    .transpose()?;
  let calibration = calibration
    .as_mut()
    .map(|source| source as &mut dyn CalibrationSource);

  let now = std::time::Instant::now();
  let path = builder.compile_if_missing(&args.model, precision, args.max_batch, calibration)?;
  info!("引擎就绪，耗时: {:.2?}", now.elapsed());
  println!("{}", path.display());

  Ok(())
}
