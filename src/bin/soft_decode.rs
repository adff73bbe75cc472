// 该文件是 Dongfeng （东风） 项目的一部分。
// src/bin/soft_decode.rs - 图像文件推理演示
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use dongfeng::{
  FromUrl,
  accelerator::CpuAccelerator,
  infer::{InferConfig, InferService},
  input::ImageFileInput,
  model::label_name,
  task::{SoftDecodeTask, Task, install_interrupt_handler},
};

/// 软解码推理：读取图像文件并输出检测结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 引擎，例如 engine:///models/yolox_s.FP32.cpu-reference.engine?variant=x
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,
  /// 输入来源，例如 image:///data/images
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 预热帧数
  #[arg(long, default_value_t = 10, value_name = "FRAMES")]
  pub warmup: usize,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("引擎: {}", args.engine);
  info!("输入来源: {}", args.input);

  let interrupt = install_interrupt_handler()?;
  let config = InferConfig::from_url(&args.engine)?;
  let service = InferService::create(config, Arc::new(CpuAccelerator::new()))?;
  let input = ImageFileInput::from_url(&args.input)?;
  let files = input.files().to_vec();

  let report = SoftDecodeTask::new()
    .with_warmup(args.warmup)
    .with_frame_limit(args.frame_number)
    .with_interrupt(interrupt)
    .run_task(input, &service)?;

  for (path, result) in files.iter().zip(&report.results) {
    match result {
      Ok(result) => {
        println!("{}: {} 个目标", path.display(), result.len());
        for obj in result.iter() {
          println!(
            "  {} {:.2} [{:.1}, {:.1}, {:.1}, {:.1}]",
            label_name(obj.class_label),
            obj.confidence,
            obj.left,
            obj.top,
            obj.right,
            obj.bottom
          );
        }
      }
      Err(e) => warn!("{}: 推理失败: {}", path.display(), e),
    }
  }
  if let Some(e) = &report.source_error {
    warn!("输入中断: {}", e);
  }
  if let Some(e) = &report.service_error {
    warn!("推理服务提前停止: {}", e);
  }

  Ok(())
}
