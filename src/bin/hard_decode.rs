// 该文件是 Dongfeng （东风） 项目的一部分。
// src/bin/hard_decode.rs - 设备解码推理演示
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use dongfeng::{
  FromUrl,
  accelerator::CpuAccelerator,
  infer::{InferConfig, InferService},
  input::{Nv12Decoder, Nv12File},
  model::label_name,
  task::{HardDecodeTask, Task, install_interrupt_handler},
};

/// 硬解码推理：解复用 NV12 文件，在设备上解码后直接推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 引擎，例如 engine:///models/yolov5s.FP16.cpu-reference.engine?variant=v5
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,
  /// NV12 视频文件
  #[arg(long, value_name = "FILE")]
  pub input: PathBuf,
  /// 解码器缓冲区数量
  #[arg(long, default_value_t = dongfeng::input::DEFAULT_RING_SIZE, value_name = "COUNT")]
  pub ring: usize,
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
  info!("输入文件: {}", args.input.display());

  let interrupt = install_interrupt_handler()?;
  let config = InferConfig::from_url(&args.engine)?;
  let device_id = config.device_id;
  let service = InferService::create(config, Arc::new(CpuAccelerator::new()))?;

  let source = Nv12File::open(&args.input)?;
  let decoder = Nv12Decoder::new(source.width(), source.height(), device_id, args.ring);

  let report = HardDecodeTask::new()
    .with_warmup(args.warmup)
    .with_frame_limit(args.frame_number)
    .with_interrupt(interrupt)
    .run_task((source, decoder), &service)?;

  for (index, result) in report.results.iter().enumerate() {
    match result {
      Ok(result) => {
        let labels: Vec<&str> = result.iter().map(|obj| label_name(obj.class_label)).collect();
        println!("第 {} 帧: {} 个目标 {:?}", index, result.len(), labels);
      }
      Err(e) => warn!("第 {} 帧推理失败: {}", index, e),
    }
  }
  if let Some(e) = &report.source_error {
    warn!("解码中断: {}", e);
  }
  if let Some(e) = &report.service_error {
    warn!("推理服务提前停止: {}", e);
  }

  let stats = service.stats();
  info!(
    "共提交 {} 帧, 执行 {} 批",
    stats.frames_committed, stats.batches_executed
  );

  Ok(())
}
