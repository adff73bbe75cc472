// 该文件是 Dongfeng （东风） 项目的一部分。
// tests/service_tests.rs - 推理服务测试
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

mod common;

use std::sync::Arc;
use std::time::Duration;

use dongfeng::accelerator::{Accelerator, CompiledPlan, CpuAccelerator, Execution, QuantizationTable};
use dongfeng::device::{DeviceBuffer, DeviceId, DevicePtr, ExecutionStream};
use dongfeng::engine::{EngineBuilder, Precision};
use dongfeng::error::{Error, Result};
use dongfeng::frame::{DeviceFrame, Frame, HostImage};
use dongfeng::infer::{InferConfig, InferService};
use dongfeng::model::{Model, NetworkDescription, NmsMethod, YoloVariant};
use dongfeng::tensor::Tensor;

use common::*;

#[test]
fn each_frame_resolves_to_its_own_detections() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service(&engine, YoloVariant::V5);

  let frames: Vec<Frame> = (0..10)
    .map(|i| {
      let (gx, gy) = cell_of(i);
      host(cell_frame(gx, gy))
    })
    .collect();
  let pending = service.commit_many(frames).unwrap();
  assert_eq!(pending.len(), 10);

  // 倒序读取，结果仍与提交位置对应
  for (i, p) in pending.iter().enumerate().rev() {
    let (gx, gy) = cell_of(i);
    assert_single_cell(&p.get().unwrap(), gx, gy);
  }
  let sequences: Vec<u64> = pending.iter().map(|p| p.sequence()).collect();
  assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn commit_returns_before_results_are_read_repeatedly() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::X, 2);
  let service = service(&engine, YoloVariant::X);

  let pending = service.commit(host(cell_frame(3, 5))).unwrap();
  let first = pending.get().unwrap();
  assert_single_cell(&first, 3, 5);
  assert_eq!(pending.get().unwrap(), first);
  assert_eq!(pending.clone().get().unwrap(), first);
  assert!(pending.is_ready());
}

#[test]
fn commit_many_of_nothing_is_empty() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service(&engine, YoloVariant::V5);

  assert!(service.commit_many(Vec::new()).unwrap().is_empty());
  assert_eq!(service.stats().frames_committed, 0);
}

#[test]
fn black_frame_has_no_detections() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service(&engine, YoloVariant::V5);

  let result = service
    .commit(host(HostImage::filled(640, 640, BLACK)))
    .unwrap()
    .get()
    .unwrap();
  assert!(result.is_empty());
}

#[test]
fn boxes_map_back_to_the_original_image() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service(&engine, YoloVariant::V5);

  // 128x64 缩放一半后上下各填充 16 行，白块对应网络输入的单元 (2, 3)
  let mut image = HostImage::filled(128, 64, BLACK);
  image.fill_rect(32, 16, 16, 16, WHITE);
  let result = service.commit(host(image)).unwrap().get().unwrap();

  assert_box_invariants(&result, 0.25, 128, 64);
  assert_eq!(result.len(), 1, "{:?}", result);
  let det = result.items[0];
  let (cx, cy) = det.center();
  assert!((cx - 40.0).abs() <= 1.0 && (cy - 24.0).abs() <= 1.0, "{:?}", det);
  assert!((det.width() - 16.0).abs() < 0.5, "{:?}", det);
  assert!((det.height() - 16.0).abs() < 0.5, "{:?}", det);
}

#[test]
fn results_are_truncated_to_the_most_confident() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 2);
  let service = service_with(InferConfig::new(&engine, YoloVariant::V5).max_objects(5));

  // 每个单元亮度不同，置信度互不相同
  let mut image = HostImage::filled(NET_SIZE, NET_SIZE, BLACK);
  for i in 0..GRID * GRID {
    let (gx, gy) = cell_of(i);
    let v = 150 + i as u8;
    image.fill_rect(gx * STRIDE, gy * STRIDE, STRIDE, STRIDE, [v, v, v]);
  }
  let result = service.commit(host(image)).unwrap().get().unwrap();

  assert_eq!(result.len(), 5);
  let fifth = (150.0 + 59.0 - 114.0) / (255.0 - 114.0);
  for det in result.iter() {
    assert!(det.confidence >= fifth - 1e-4, "{:?}", det);
    assert!(det.top >= 56.0 - 0.5, "{:?}", det);
  }
  assert_box_invariants(&result, 0.25, NET_SIZE, NET_SIZE);
}

#[test]
fn confidence_threshold_filters_dim_cells() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 2);
  let service = service_with(
    InferConfig::new(&engine, YoloVariant::V5)
      .confidence_threshold(0.5)
      .nms_method(NmsMethod::Reference),
  );

  // 亮度 150 的置信度约 0.26，亮度 220 约 0.75
  let mut image = HostImage::filled(NET_SIZE, NET_SIZE, BLACK);
  image.fill_rect(0, 0, STRIDE, STRIDE, [150, 150, 150]);
  image.fill_rect(40, 40, STRIDE, STRIDE, [220, 220, 220]);
  let result = service.commit(host(image)).unwrap().get().unwrap();

  assert_eq!(result.len(), 1);
  assert_box_invariants(&result, 0.5, NET_SIZE, NET_SIZE);
  assert_single_cell(&result, 5, 5);
}

#[test]
fn empty_frames_are_rejected_synchronously() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service(&engine, YoloVariant::V5);

  assert!(matches!(service.commit(Frame::Empty), Err(Error::EmptyFrame)));
  assert!(matches!(
    service.commit(host(HostImage::filled(0, 10, BLACK))),
    Err(Error::EmptyFrame)
  ));
  let frames = vec![host(cell_frame(0, 0)), Frame::Empty];
  assert!(matches!(service.commit_many(frames), Err(Error::EmptyFrame)));
  assert_eq!(service.stats().frames_committed, 0);
}

#[test]
fn shutdown_rejects_new_work_and_drains_accepted_work() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service_with(
    InferConfig::new(&engine, YoloVariant::V5).max_batch_delay(Duration::from_millis(20)),
  );

  let pending: Vec<_> = (0..6)
    .map(|i| {
      let (gx, gy) = cell_of(i);
      service.commit(host(cell_frame(gx, gy))).unwrap()
    })
    .collect();
  service.shutdown();
  assert!(service.is_closed());
  assert!(matches!(
    service.commit(host(cell_frame(0, 0))),
    Err(Error::ServiceClosed)
  ));
  assert!(matches!(
    service.commit_many(vec![host(cell_frame(0, 0))]),
    Err(Error::ServiceClosed)
  ));

  for (i, p) in pending.iter().enumerate() {
    let (gx, gy) = cell_of(i);
    assert_single_cell(&p.get().unwrap(), gx, gy);
  }
}

#[test]
fn frames_are_batched_up_to_the_engine_limit() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service_with(
    InferConfig::new(&engine, YoloVariant::V5).max_batch_delay(Duration::from_millis(50)),
  );

  let frames = (0..8).map(|_| host(cell_frame(1, 1))).collect();
  for p in service.commit_many(frames).unwrap() {
    assert_single_cell(&p.get().unwrap(), 1, 1);
  }
  let stats = service.stats();
  assert_eq!(stats.frames_committed, 8);
  assert_eq!(stats.frames_failed, 0);
  assert!((2..=8).contains(&stats.batches_executed), "{:?}", stats);
}

fn device_frame(nv12: &[u8], stream: &ExecutionStream) -> Frame {
  // 数据在解码流上写入，提交时必须先同步
  let buffer = DeviceBuffer::alloc(0, nv12.len());
  let target = buffer.clone();
  let payload = nv12.to_vec();
  stream.enqueue(move || target.write().copy_from_slice(&payload));
  Frame::DeviceYuv(DeviceFrame::new(
    DevicePtr::new(buffer, 0),
    NET_SIZE,
    NET_SIZE,
    0,
    stream.clone(),
  ))
}

#[test]
fn device_and_host_frames_give_identical_results() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);

  for multi_stream in [false, true] {
    let service = service_with(
      InferConfig::new(&engine, YoloVariant::V5).multi_preprocess_stream(multi_stream),
    );
    let decode_stream = ExecutionStream::new(0);

    for i in [0, 9, 27, 63] {
      let (gx, gy) = cell_of(i);
      let nv12 = cell_nv12(gx, gy);
      let host_frame = host(HostImage::from_nv12(NET_SIZE, NET_SIZE, &nv12).unwrap());

      let pending = service
        .commit_many(vec![device_frame(&nv12, &decode_stream), host_frame])
        .unwrap();
      assert_eq!(decode_stream.pending(), 0);

      let device_result = pending[0].get().unwrap();
      let host_result = pending[1].get().unwrap();
      assert_eq!(device_result, host_result);
      assert_single_cell(&device_result, gx, gy);
    }
  }
}

#[test]
fn multi_stream_preprocessing_is_not_observable() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::X, 4);
  let single = service(&engine, YoloVariant::X);
  let multi = service_with(InferConfig::new(&engine, YoloVariant::X).multi_preprocess_stream(true));

  let frames: Vec<Frame> = (0..6)
    .map(|i| {
      let (gx, gy) = cell_of(i * 7);
      let mut image = cell_frame(gx, gy);
      image.fill_rect(0, 56, 64, 8, [200, 30, 30]);
      host(image)
    })
    .collect();

  let a = single.commit_many(frames.clone()).unwrap();
  let b = multi.commit_many(frames).unwrap();
  for (a, b) in a.iter().zip(&b) {
    assert_eq!(a.get().unwrap(), b.get().unwrap());
  }
}

#[test]
fn service_works_through_the_model_trait() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 1);
  let service = service(&engine, YoloVariant::V5);

  service.warmup(3).unwrap();
  let result = service.infer(&host(cell_frame(6, 2))).unwrap();
  assert_single_cell(&result, 6, 2);
  assert_eq!(service.stats().frames_committed, 4);
}

#[test]
fn variant_mismatch_is_a_configuration_error() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 1);
  let result = InferService::create(
    InferConfig::new(&engine, YoloVariant::X),
    Arc::new(CpuAccelerator::new()),
  );
  assert!(matches!(result, Err(Error::Configuration(_))));

  let missing = dir.path().join("missing.engine");
  let result = InferService::create(
    InferConfig::new(missing, YoloVariant::V5),
    Arc::new(CpuAccelerator::new()),
  );
  assert!(matches!(result, Err(Error::Configuration(_))));
}

/// 故障加速器的执行方式
#[derive(Clone, Copy)]
enum Fault {
  /// 每次执行都报错
  DeviceLost,
  /// 输出长度不是候选框长度的整数倍
  ShortOutput,
}

/// 编译与参考实现相同，执行时按 `Fault` 出错
struct FaultyAccelerator(Fault);

struct FaultyExecution(Fault);

impl Execution for FaultyExecution {
  fn forward(&mut self, _input: &Tensor, batch: usize) -> Result<Vec<Vec<f32>>> {
    match self.0 {
      Fault::DeviceLost => Err(Error::Inference("设备丢失".to_string())),
      Fault::ShortOutput => Ok(vec![vec![1.0; 7]; batch]),
    }
  }
}

impl Accelerator for FaultyAccelerator {
  fn target(&self) -> &str {
    match self.0 {
      Fault::DeviceLost => "broken",
      Fault::ShortOutput => "truncated",
    }
  }

  fn compile(
    &self,
    network: &NetworkDescription,
    precision: Precision,
    max_batch_size: usize,
    quantization: Option<QuantizationTable>,
  ) -> std::result::Result<CompiledPlan, String> {
    CpuAccelerator::new().compile(network, precision, max_batch_size, quantization)
  }

  fn load(&self, _plan: &CompiledPlan, _device_id: DeviceId) -> Result<Box<dyn Execution>> {
    Ok(Box::new(FaultyExecution(self.0)))
  }
}

fn faulty_service(dir: &std::path::Path, fault: Fault) -> (std::path::PathBuf, InferService) {
  let model = write_model(dir, &network("grid", YoloVariant::V5));
  let accelerator = Arc::new(FaultyAccelerator(fault));
  let engine = EngineBuilder::new(accelerator.clone())
    .compile_if_missing(&model, Precision::Fp32, 4, None)
    .unwrap();
  let service = InferService::create(InferConfig::new(&engine, YoloVariant::V5), accelerator).unwrap();
  (engine, service)
}

#[test]
fn executor_failure_resolves_every_frame_of_the_batch_to_an_error() {
  let dir = tempfile::tempdir().unwrap();
  let (engine, service) = faulty_service(dir.path(), Fault::DeviceLost);
  assert!(engine.to_string_lossy().ends_with("grid.FP32.broken.engine"));

  // 引擎目标与加速器不符
  assert!(matches!(
    InferService::create(
      InferConfig::new(&engine, YoloVariant::V5),
      Arc::new(CpuAccelerator::new())
    ),
    Err(Error::Configuration(_))
  ));

  let pending = service
    .commit_many((0..3).map(|_| host(cell_frame(0, 0))).collect())
    .unwrap();
  for p in &pending {
    assert!(matches!(p.get(), Err(Error::Inference(_))));
  }

  // 失败之后服务仍然接收新帧
  let later = service.commit(host(cell_frame(0, 0))).unwrap();
  assert!(later.get().is_err());
  assert_eq!(service.stats().frames_failed, 4);
}

#[test]
fn malformed_executor_output_is_a_frame_failure() {
  let dir = tempfile::tempdir().unwrap();
  let (_, service) = faulty_service(dir.path(), Fault::ShortOutput);

  let pending = service
    .commit_many((0..2).map(|i| host(cell_frame(i, 0))).collect())
    .unwrap();
  for p in &pending {
    assert!(matches!(p.get(), Err(Error::Inference(_))), "{:?}", p.get());
  }
  assert_eq!(service.stats().frames_failed, 2);
}

#[test]
fn preprocessing_failure_only_fails_its_own_frame() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service_with(
    InferConfig::new(&engine, YoloVariant::V5).max_batch_delay(Duration::from_millis(50)),
  );

  // 缓冲区不为空，但比一帧 NV12 数据短
  let stream = ExecutionStream::new(0);
  let short = Frame::DeviceYuv(DeviceFrame::new(
    DevicePtr::new(DeviceBuffer::alloc(0, 16), 0),
    NET_SIZE,
    NET_SIZE,
    0,
    stream,
  ));
  assert!(!short.empty());

  let pending = service
    .commit_many(vec![
      host(cell_frame(1, 1)),
      short,
      host(cell_frame(2, 2)),
    ])
    .unwrap();

  assert_single_cell(&pending[0].get().unwrap(), 1, 1);
  assert!(matches!(pending[1].get(), Err(Error::Inference(_))));
  assert_single_cell(&pending[2].get().unwrap(), 2, 2);
  assert_eq!(service.stats().frames_failed, 1);
}

#[test]
fn concurrent_producers_get_their_own_results() {
  let dir = tempfile::tempdir().unwrap();
  let engine = engine(dir.path(), YoloVariant::V5, 4);
  let service = service(&engine, YoloVariant::V5);
  let producers = 4;
  let per_producer = 6;

  std::thread::scope(|scope| {
    let handles: Vec<_> = (0..producers)
      .map(|p| {
        let service = &service;
        scope.spawn(move || {
          let pending: Vec<_> = (0..per_producer)
            .map(|i| {
              let (gx, gy) = cell_of(p * per_producer + i);
              service.commit(host(cell_frame(gx, gy))).unwrap()
            })
            .collect();
          (p, pending)
        })
      })
      .collect();

    for handle in handles {
      let (p, pending) = handle.join().unwrap();
      for (i, result) in pending.iter().enumerate() {
        let (gx, gy) = cell_of(p * per_producer + i);
        assert_single_cell(&result.get().unwrap(), gx, gy);
      }
    }
  });

  assert_eq!(service.stats().frames_committed, (producers * per_producer) as u64);
  assert_eq!(service.stats().frames_failed, 0);
}
