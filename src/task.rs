// 该文件是 Dongfeng （东风） 项目的一部分。
// src/task.rs - 流水线驱动任务
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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use std::thread;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::infer::{InferService, PendingResult};
use crate::input::{HardwareDecoder, Packet, PacketSource};
use crate::model::DetectResult;

pub trait Task<I, M>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M) -> Result<Self::Output, Self::Error>;
}

/// 注册 Ctrl-C 处理，返回中断标志
///
/// 第一次中断只设置标志，30 秒内任务未退出则强制结束进程。
pub fn install_interrupt_handler() -> std::result::Result<Arc<AtomicBool>, ctrlc::Error> {
  let flag = Arc::new(AtomicBool::new(false));
  let handler_flag = flag.clone();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    handler_flag.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(flag)
}

/// 一次驱动的结果
#[derive(Debug)]
pub struct DriverReport {
  /// 按提交顺序排列的每帧结果
  pub results: Vec<Result<DetectResult>>,
  /// 使生产循环提前结束的帧来源错误
  pub source_error: Option<Error>,
  /// 推理服务拒绝提交时的错误，例如服务已关闭
  pub service_error: Option<Error>,
  /// 从第一帧提交到全部结果就绪的耗时，不含预热
  pub elapsed: Duration,
}

impl DriverReport {
  pub fn frames(&self) -> usize {
    self.results.len()
  }

  pub fn failures(&self) -> usize {
    self.results.iter().filter(|r| r.is_err()).count()
  }

  pub fn detections(&self) -> usize {
    self
      .results
      .iter()
      .filter_map(|r| r.as_ref().ok())
      .map(DetectResult::len)
      .sum()
  }

  pub fn average_frame_time(&self) -> Option<Duration> {
    u32::try_from(self.frames())
      .ok()
      .filter(|&n| n > 0)
      .map(|n| self.elapsed / n)
  }
}

/// 生产循环的公共控制
#[derive(Debug, Clone, Default)]
struct DriverControl {
  warmup: usize,
  frame_limit: Option<usize>,
  interrupt: Option<Arc<AtomicBool>>,
}

impl DriverControl {
  fn should_stop(&self, committed: usize) -> bool {
    if self.frame_limit.is_some_and(|limit| committed >= limit) {
      info!("达到指定帧数 {}, 退出任务循环", committed);
      return true;
    }
    if self
      .interrupt
      .as_ref()
      .is_some_and(|flag| flag.load(Ordering::SeqCst))
    {
      warn!("中断信号接收，退出任务循环");
      return true;
    }
    false
  }

  fn warmup(&self, service: &InferService) -> Result<()> {
    if self.warmup > 0 {
      info!("预热 {} 帧...", self.warmup);
      service.warmup(self.warmup)?;
    }
    Ok(())
  }
}

/// 生产循环结束的原因
#[derive(Debug)]
enum Stopped {
  Finished,
  Source(Error),
  Service(Error),
}

/// 等待已发出的全部结果，只阻塞驱动线程
fn collect_report(pending: Vec<PendingResult>, stopped: Stopped, started: Instant) -> DriverReport {
  let (source_error, service_error) = match stopped {
    Stopped::Finished => (None, None),
    Stopped::Source(e) => {
      warn!("帧来源错误，停止提交: {}", e);
      (Some(e), None)
    }
    Stopped::Service(e) => {
      warn!("推理服务拒绝提交，停止提交: {}", e);
      (None, Some(e))
    }
  };
  let results: Vec<Result<DetectResult>> = pending.iter().map(PendingResult::get).collect();
  let report = DriverReport {
    results,
    source_error,
    service_error,
    elapsed: started.elapsed(),
  };
  info!(
    "任务完成: {} 帧, {} 个目标, 失败 {} 帧, 耗时 {:.2?}",
    report.frames(),
    report.detections(),
    report.failures(),
    report.elapsed
  );
  if let Some(avg) = report.average_frame_time() {
    info!("平均每帧耗时: {:.2?}", avg);
  }
  report
}

macro_rules! driver_builder {
  ($name:ident) => {
    impl $name {
      pub fn new() -> Self {
        Self::default()
      }

      /// 计时前用黑图预热的帧数
      pub fn with_warmup(mut self, frames: usize) -> Self {
        self.control.warmup = frames;
        self
      }

      pub fn with_frame_limit(mut self, frame_limit: Option<usize>) -> Self {
        self.control.frame_limit = frame_limit;
        self
      }

      pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.control.interrupt = Some(flag);
        self
      }
    }
  };
}

/// 软解码驱动：逐帧提交主机帧
#[derive(Debug, Clone, Default)]
pub struct SoftDecodeTask {
  control: DriverControl,
}

driver_builder!(SoftDecodeTask);

impl<I: Iterator<Item = Result<Frame>>> Task<I, &InferService> for SoftDecodeTask {
  type Output = DriverReport;
  type Error = Error;

  fn run_task(self, mut input: I, service: &InferService) -> Result<DriverReport> {
    self.control.warmup(service)?;
    info!("开始软解码任务...");

    let started = Instant::now();
    let mut pending = Vec::new();
    let mut stopped = Stopped::Finished;

    // 先检查再取帧，停止时不会多读一帧
    while !self.control.should_stop(pending.len()) {
      let Some(item) = input.next() else {
        break;
      };
      match item {
        Ok(frame) if frame.empty() => warn!("跳过空帧"),
        Ok(frame) => match service.commit(frame) {
          Ok(result) => pending.push(result),
          Err(e) => {
            stopped = Stopped::Service(e);
            break;
          }
        },
        Err(e) => {
          stopped = Stopped::Source(e);
          break;
        }
      }
    }

    debug!("已提交 {} 帧，等待结果", pending.len());
    Ok(collect_report(pending, stopped, started))
  }
}

/// 硬解码驱动：解复用、设备上解码，再提交设备帧
#[derive(Debug, Clone, Default)]
pub struct HardDecodeTask {
  control: DriverControl,
}

driver_builder!(HardDecodeTask);

impl<P: PacketSource, D: HardwareDecoder> Task<(P, D), &InferService> for HardDecodeTask {
  type Output = DriverReport;
  type Error = Error;

  fn run_task(self, input: (P, D), service: &InferService) -> Result<DriverReport> {
    let (mut source, mut decoder) = input;
    self.control.warmup(service)?;
    info!(
      "开始硬解码任务: {}x{}, 设备 {}",
      decoder.width(),
      decoder.height(),
      decoder.device_id()
    );

    let started = Instant::now();
    let mut pending = Vec::new();
    let stopped = drive_decoder(
      &self.control,
      &mut source,
      &mut decoder,
      service,
      &mut pending,
    );

    debug!("已提交 {} 帧，等待结果", pending.len());
    Ok(collect_report(pending, stopped, started))
  }
}

/// 解复用与解码循环，已提交的结果写入 `pending`
///
/// 解复用器没有更多数据时仍会送入一个空包冲刷解码器，取出缓存的帧。
fn drive_decoder<P: PacketSource, D: HardwareDecoder>(
  control: &DriverControl,
  source: &mut P,
  decoder: &mut D,
  service: &InferService,
  pending: &mut Vec<PendingResult>,
) -> Stopped {
  let extra_data = source.extra_data();
  if !extra_data.is_empty() {
    if let Err(e) = decoder.decode(extra_data, 0) {
      return Stopped::Source(e);
    }
  }

  let mut last_pts = 0;
  loop {
    if control.should_stop(pending.len()) {
      return Stopped::Finished;
    }

    let packet = match source.demux() {
      Ok(Some(packet)) => packet,
      Ok(None) => {
        debug!("解复用结束，冲刷解码器");
        Packet::new(Vec::new(), last_pts)
      }
      Err(e) => return Stopped::Source(e),
    };
    last_pts = packet.pts;

    let ndecoded = match decoder.decode(&packet.data, packet.pts) {
      Ok(n) => n,
      Err(e) => return Stopped::Source(e),
    };

    for _ in 0..ndecoded {
      let Some(decoded) = decoder.get_frame() else {
        break;
      };
      debug!("解码帧 {} (pts {})", decoded.index, decoded.pts);
      let frame = decoder.device_frame(&decoded);
      match service.commit(Frame::DeviceYuv(frame)) {
        Ok(result) => pending.push(result),
        Err(e) => return Stopped::Service(e),
      }
      if control.should_stop(pending.len()) {
        return Stopped::Finished;
      }
    }

    if packet.is_empty() {
      return Stopped::Finished;
    }
  }
}
