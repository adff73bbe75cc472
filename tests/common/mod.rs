// 该文件是 Dongfeng （东风） 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
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

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dongfeng::accelerator::CpuAccelerator;
use dongfeng::engine::{EngineBuilder, Precision};
use dongfeng::frame::{Frame, HostImage, nv12_size};
use dongfeng::infer::{InferConfig, InferService};
use dongfeng::model::{DetectResult, NetworkDescription, YoloVariant};

pub const NET_SIZE: usize = 64;
pub const STRIDE: usize = 8;
pub const GRID: usize = NET_SIZE / STRIDE;
pub const WHITE: [u8; 3] = [255, 255, 255];
pub const BLACK: [u8; 3] = [0, 0, 0];

pub fn network(name: &str, variant: YoloVariant) -> NetworkDescription {
  NetworkDescription {
    name: name.to_string(),
    variant,
    input_width: NET_SIZE,
    input_height: NET_SIZE,
    num_classes: 80,
    stride: STRIDE,
  }
}

/// 写出模型源文件，返回路径
pub fn write_model(dir: &Path, network: &NetworkDescription) -> PathBuf {
  let path = dir.join(format!("{}.json", network.name));
  network.save(&path).unwrap();
  path
}

pub fn builder(dir: &Path) -> EngineBuilder {
  EngineBuilder::new(Arc::new(CpuAccelerator::new())).artifact_dir(dir.join("engines"))
}

/// 编译一个 FP32 引擎，返回引擎文件路径
pub fn engine(dir: &Path, variant: YoloVariant, max_batch: usize) -> PathBuf {
  let model = write_model(dir, &network("grid", variant));
  builder(dir)
    .compile_if_missing(&model, Precision::Fp32, max_batch, None)
    .unwrap()
}

pub fn service(engine: &Path, variant: YoloVariant) -> InferService {
  service_with(InferConfig::new(engine, variant))
}

pub fn service_with(config: InferConfig) -> InferService {
  InferService::create(config, Arc::new(CpuAccelerator::new())).unwrap()
}

/// 黑底图像，在网格单元 `(gx, gy)` 上放一个白色方块
pub fn cell_frame(gx: usize, gy: usize) -> HostImage {
  let mut image = HostImage::filled(NET_SIZE, NET_SIZE, BLACK);
  image.fill_rect(gx * STRIDE, gy * STRIDE, STRIDE, STRIDE, WHITE);
  image
}

/// 与 `cell_frame` 内容相同的 NV12 数据
pub fn cell_nv12(gx: usize, gy: usize) -> Vec<u8> {
  let mut data = vec![0u8; NET_SIZE * NET_SIZE];
  for y in gy * STRIDE..(gy + 1) * STRIDE {
    for x in gx * STRIDE..(gx + 1) * STRIDE {
      data[y * NET_SIZE + x] = 255;
    }
  }
  data.resize(nv12_size(NET_SIZE, NET_SIZE), 128);
  data
}

/// 第 `i` 帧对应的网格单元
pub fn cell_of(i: usize) -> (usize, usize) {
  (i % GRID, (i / GRID) % GRID)
}

pub fn host(image: HostImage) -> Frame {
  Frame::Host(image)
}

/// 检查结果恰好是单元 `(gx, gy)` 上的一个框
pub fn assert_single_cell(result: &DetectResult, gx: usize, gy: usize) {
  assert_eq!(result.len(), 1, "单元 ({}, {}) 的结果: {:?}", gx, gy, result);
  let det = result.items[0];
  let (cx, cy) = det.center();
  assert!((cx - (gx * STRIDE) as f32 - 4.0).abs() < 0.5, "{:?}", det);
  assert!((cy - (gy * STRIDE) as f32 - 4.0).abs() < 0.5, "{:?}", det);
  assert!((det.width() - STRIDE as f32).abs() < 0.5, "{:?}", det);
  assert_eq!(det.class_label, 0);
}

/// 每个检测框都满足置信度与坐标约束
pub fn assert_box_invariants(result: &DetectResult, threshold: f32, width: usize, height: usize) {
  for det in result.iter() {
    assert!(det.confidence >= threshold && det.confidence <= 1.0, "{:?}", det);
    assert!(det.left <= det.right && det.top <= det.bottom, "{:?}", det);
    assert!(det.left >= 0.0 && det.top >= 0.0, "{:?}", det);
    assert!(det.right <= width as f32 && det.bottom <= height as f32, "{:?}", det);
  }
}
