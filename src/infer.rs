// 该文件是 Dongfeng （东风） 项目的一部分。
// src/infer.rs - 异步批量推理服务
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

//! # 推理服务
//!
//! [`InferService`] 接收帧并立即返回 [`PendingResult`]，推理在内部线程上完成：
//!
//! 1. `commit` 在调用线程上完成预处理。设备帧会先同步解码器的执行流，
//!    `commit` 返回后解码器即可复用该帧的缓冲区。
//! 2. 推理线程收集已提交的帧，凑满引擎的最大批大小或等待超过
//!    `max_batch_delay` 后执行一次批量推理。
//! 3. 后处理（解码、置信度过滤、映射回原图、NMS、截断）后写入各帧的结果。
//!
//! 结果与提交的帧一一对应，内部完成顺序不作保证。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendError, Sender};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::accelerator::{Accelerator, Execution};
use crate::device::ExecutionStream;
use crate::engine::EngineArtifact;
use crate::error::{Error, Result};
use crate::frame::{Frame, HostImage};
use crate::model::postprocess::{PostprocessConfig, postprocess};
use crate::model::{DetectResult, Model, NetworkDescription};
use crate::preprocess::{AffineMatrix, image_to_tensor};
use crate::tensor::Tensor;

pub mod config;
pub mod pending;

pub use self::config::InferConfig;
pub use self::pending::PendingResult;
use self::pending::{Promise, pending_pair};

/// 预处理完成、等待推理的一帧
struct Prepared {
  tensor: Tensor,
  affine: AffineMatrix,
  image_size: (usize, usize),
}

struct Job {
  promise: Promise,
  input: Result<Prepared>,
}

#[derive(Default)]
struct Counters {
  committed: AtomicU64,
  batches: AtomicU64,
  failed: AtomicU64,
}

/// 服务计数，包含预热帧
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
  pub frames_committed: u64,
  pub batches_executed: u64,
  pub frames_failed: u64,
}

pub struct InferService {
  config: InferConfig,
  network: NetworkDescription,
  max_batch_size: usize,
  sender: RwLock<Option<Sender<Job>>>,
  worker: Mutex<Option<JoinHandle<()>>>,
  counters: Arc<Counters>,
  sequence: AtomicU64,
  host_stream: ExecutionStream,
  preprocess_stream: Option<ExecutionStream>,
}

impl InferService {
  /// 从 `config.engine_file` 加载引擎并启动推理线程
  pub fn create(config: InferConfig, accelerator: Arc<dyn Accelerator>) -> Result<Self> {
    config.validate()?;
    info!("加载引擎文件: {}", config.engine_file.display());
    let artifact = EngineArtifact::load(&config.engine_file)?;
    Self::with_artifact(config, &artifact, accelerator.as_ref())
  }

  /// 使用已经加载的引擎启动服务
  pub fn with_artifact(
    config: InferConfig,
    artifact: &EngineArtifact,
    accelerator: &dyn Accelerator,
  ) -> Result<Self> {
    config.validate()?;
    if artifact.key.target != accelerator.target() {
      return Err(Error::Configuration(format!(
        "引擎目标 {} 与加速器 {} 不符",
        artifact.key.target,
        accelerator.target()
      )));
    }
    let network = artifact.network().clone();
    if network.variant != config.variant {
      return Err(Error::Configuration(format!(
        "引擎网络类型 {} 与配置 {} 不符",
        network.variant.type_name(),
        config.variant.type_name()
      )));
    }

    let execution = accelerator.load(&artifact.plan, config.device_id)?;
    let max_batch_size = artifact.max_batch_size().max(1);
    let counters = Arc::new(Counters::default());
    let (sender, receiver) = crossbeam_channel::unbounded();

    let worker = Worker {
      receiver,
      execution,
      network: network.clone(),
      max_batch_size,
      max_batch_delay: config.max_batch_delay,
      postprocess: config.postprocess(),
      counters: counters.clone(),
    };
    let handle = std::thread::Builder::new()
      .name("dongfeng-infer".to_string())
      .spawn(move || worker.run())?;

    info!(
      "推理服务已启动: {} ({}), 设备 {}, 最大批大小 {}, 等待窗口 {:?}",
      network.name,
      network.variant.type_name(),
      config.device_id,
      max_batch_size,
      config.max_batch_delay
    );

    let preprocess_stream = config
      .use_multi_preprocess_stream
      .then(|| ExecutionStream::new(config.device_id));
    Ok(Self {
      host_stream: ExecutionStream::new(config.device_id),
      preprocess_stream,
      config,
      network,
      max_batch_size,
      sender: RwLock::new(Some(sender)),
      worker: Mutex::new(Some(handle)),
      counters,
      sequence: AtomicU64::new(0),
    })
  }

  pub fn config(&self) -> &InferConfig {
    &self.config
  }

  pub fn network(&self) -> &NetworkDescription {
    &self.network
  }

  pub fn max_batch_size(&self) -> usize {
    self.max_batch_size
  }

  pub fn stats(&self) -> ServiceStats {
    ServiceStats {
      frames_committed: self.counters.committed.load(Ordering::Acquire),
      batches_executed: self.counters.batches.load(Ordering::Acquire),
      frames_failed: self.counters.failed.load(Ordering::Acquire),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.sender_guard().is_none()
  }

  /// 提交一帧，不等待推理
  ///
  /// 服务关闭后返回 [`Error::ServiceClosed`]，空帧返回 [`Error::EmptyFrame`]。
  /// 预处理失败不会让提交失败，而是体现在返回的结果里。
  pub fn commit(&self, frame: Frame) -> Result<PendingResult> {
    let guard = self.sender_guard();
    let sender = guard.as_ref().ok_or(Error::ServiceClosed)?;
    if frame.empty() {
      return Err(Error::EmptyFrame);
    }
    let prepared = self.prepare(&frame, self.stream_for(&frame));
    Ok(self.dispatch(sender, prepared))
  }

  /// 按顺序提交多帧，返回的结果与输入逐一对应
  ///
  /// 任何一帧为空时整体拒绝，不提交任何帧。
  pub fn commit_many(&self, frames: Vec<Frame>) -> Result<Vec<PendingResult>> {
    let guard = self.sender_guard();
    let sender = guard.as_ref().ok_or(Error::ServiceClosed)?;
    if let Some(index) = frames.iter().position(Frame::empty) {
      warn!("第 {} 帧为空，拒绝整批提交", index);
      return Err(Error::EmptyFrame);
    }

    let prepared: Vec<Result<Prepared>> = if self.preprocess_stream.is_some() {
      // 每帧一条独立的流，并行预处理
      frames
        .par_iter()
        .map(|frame| {
          let stream = ExecutionStream::new(self.config.device_id);
          self.prepare(frame, &stream)
        })
        .collect()
    } else {
      frames
        .iter()
        .map(|frame| self.prepare(frame, self.stream_for(frame)))
        .collect()
    };

    Ok(
      prepared
        .into_iter()
        .map(|input| self.dispatch(sender, input))
        .collect(),
    )
  }

  /// 用 `n` 帧黑图预热，等待全部完成
  pub fn warmup(&self, n: usize) -> Result<()> {
    if n == 0 {
      return Ok(());
    }
    let started = Instant::now();
    let black = Frame::Host(HostImage::filled(
      self.network.input_width,
      self.network.input_height,
      [0, 0, 0],
    ));
    for pending in self.commit_many(vec![black; n])? {
      pending.get()?;
    }
    info!("预热完成: {} 帧, 耗时 {:.2?}", n, started.elapsed());
    Ok(())
  }

  /// 停止接收新帧，已提交的帧仍会完成
  pub fn shutdown(&self) {
    let sender = self
      .sender
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if sender.is_some() {
      info!("推理服务停止接收新帧");
    }
  }

  fn sender_guard(&self) -> RwLockReadGuard<'_, Option<Sender<Job>>> {
    self
      .sender
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn stream_for<'a>(&'a self, frame: &'a Frame) -> &'a ExecutionStream {
    match (&self.preprocess_stream, frame) {
      (Some(stream), _) => stream,
      (None, Frame::DeviceYuv(device_frame)) => &device_frame.stream,
      (None, _) => &self.host_stream,
    }
  }

  fn prepare(&self, frame: &Frame, stream: &ExecutionStream) -> Result<Prepared> {
    let mut tensor = Tensor::input(1, self.network.input_height, self.network.input_width);
    let affine = image_to_tensor(frame, self.config.variant, &mut tensor, 0, Some(stream))?;
    Ok(Prepared {
      tensor,
      affine,
      image_size: (frame.width(), frame.height()),
    })
  }

  fn dispatch(&self, sender: &Sender<Job>, input: Result<Prepared>) -> PendingResult {
    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
    let (promise, pending) = pending_pair(sequence);
    self.counters.committed.fetch_add(1, Ordering::AcqRel);
    if let Err(e) = &input {
      warn!("第 {} 帧预处理失败: {}", sequence, e);
    }

    if let Err(SendError(job)) = sender.send(Job { promise, input }) {
      error!("推理线程已退出，第 {} 帧无法推理", sequence);
      self.counters.failed.fetch_add(1, Ordering::AcqRel);
      job
        .promise
        .set(Err(Error::Inference("推理线程已退出".to_string())));
    }
    pending
  }
}

impl Drop for InferService {
  fn drop(&mut self) {
    self.shutdown();
    let handle = self
      .worker
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(handle) = handle {
      if handle.join().is_err() {
        error!("推理线程异常退出");
      }
    }
    let stats = self.stats();
    debug!(
      "推理服务结束: 提交 {} 帧, 执行 {} 批, 失败 {} 帧",
      stats.frames_committed, stats.batches_executed, stats.frames_failed
    );
  }
}

impl Model for InferService {
  type Input = Frame;
  type Output = DetectResult;
  type Error = Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.commit(input.clone())?.get()
  }
}

struct Worker {
  receiver: Receiver<Job>,
  execution: Box<dyn Execution>,
  network: NetworkDescription,
  max_batch_size: usize,
  max_batch_delay: Duration,
  postprocess: PostprocessConfig,
  counters: Arc<Counters>,
}

impl Worker {
  fn run(mut self) {
    debug!("推理线程启动");
    // 发送端全部关闭且队列取空后 recv 返回错误
    while let Ok(first) = self.receiver.recv() {
      let jobs = self.collect(first);
      self.process(jobs);
    }
    debug!("推理线程退出");
  }

  /// 收集一批：凑满最大批大小或等待窗口到期
  fn collect(&self, first: Job) -> Vec<Job> {
    let deadline = Instant::now() + self.max_batch_delay;
    let mut jobs = Vec::with_capacity(self.max_batch_size);
    jobs.push(first);
    while jobs.len() < self.max_batch_size {
      match self.receiver.recv_deadline(deadline) {
        Ok(job) => jobs.push(job),
        Err(_) => break,
      }
    }
    jobs
  }

  fn process(&mut self, jobs: Vec<Job>) {
    let mut ready = Vec::with_capacity(jobs.len());
    for Job { promise, input } in jobs {
      match input {
        Ok(prepared) => ready.push((promise, prepared)),
        Err(e) => self.fail(promise, e),
      }
    }
    if ready.is_empty() {
      return;
    }

    let started = Instant::now();
    let batch_size = ready.len();
    let outputs = self.forward(&ready);
    self.counters.batches.fetch_add(1, Ordering::AcqRel);

    match outputs {
      Ok(outputs) => {
        for ((promise, prepared), raw) in ready.into_iter().zip(outputs) {
          match postprocess(
            &raw,
            self.network.num_classes,
            &prepared.affine,
            prepared.image_size,
            &self.postprocess,
          ) {
            Ok(result) => promise.set(Ok(result)),
            Err(e) => self.fail(promise, e),
          }
        }
        debug!("批量推理 {} 帧, 耗时 {:.2?}", batch_size, started.elapsed());
      }
      Err(e) => {
        error!("批量推理失败: {}", e);
        for (promise, _) in ready {
          self.fail(promise, e.clone());
        }
      }
    }
  }

  fn forward(&mut self, ready: &[(Promise, Prepared)]) -> Result<Vec<Vec<f32>>> {
    let mut batch = Tensor::input(
      ready.len(),
      self.network.input_height,
      self.network.input_width,
    );
    for (ibatch, (_, prepared)) in ready.iter().enumerate() {
      batch.copy_slot_from(ibatch, &prepared.tensor, 0)?;
    }
    let outputs = self.execution.forward(&batch, ready.len())?;
    if outputs.len() != ready.len() {
      return Err(Error::Inference(format!(
        "推理输出数量 {} 与批大小 {} 不符",
        outputs.len(),
        ready.len()
      )));
    }
    Ok(outputs)
  }

  fn fail(&self, promise: Promise, e: Error) {
    self.counters.failed.fetch_add(1, Ordering::AcqRel);
    let e = match e {
      Error::Inference(_) => e,
      other => Error::Inference(other.to_string()),
    };
    debug!("第 {} 帧推理失败: {}", promise.sequence(), e);
    promise.set(Err(e));
  }
}
