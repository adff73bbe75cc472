// 该文件是 Dongfeng （东风） 项目的一部分。
// src/model/postprocess.rs - 检测输出后处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::cmp::Ordering;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::model::{DetectResult, DetectedObject, NmsMethod};
use crate::preprocess::AffineMatrix;

/// 后处理参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostprocessConfig {
  pub confidence_threshold: f32,
  pub nms_threshold: f32,
  pub nms_method: NmsMethod,
  pub max_objects: usize,
}

/// 解码原始输出，返回原图坐标下超过置信度阈值的候选框
///
/// 每个候选框的布局为 `[cx, cy, w, h, objectness, 类别分数...]`。
/// 输出长度与布局不符时返回 [`Error::Inference`]。
pub fn decode_candidates(
  raw: &[f32],
  num_classes: usize,
  affine: &AffineMatrix,
  image_size: (usize, usize),
  confidence_threshold: f32,
) -> Result<Vec<DetectedObject>> {
  let candidate_len = 5 + num_classes;
  if num_classes == 0 || raw.len() % candidate_len != 0 {
    error!(
      "输出大小不匹配: 长度 {}, 每个候选框 {}",
      raw.len(),
      candidate_len
    );
    return Err(Error::Inference(format!(
      "推理输出长度 {} 不是候选框长度 {} 的整数倍",
      raw.len(),
      candidate_len
    )));
  }

  let (img_w, img_h) = (image_size.0 as f32, image_size.1 as f32);
  let mut items = Vec::new();

  for candidate in raw.chunks_exact(candidate_len) {
    let objectness = candidate[4];
    if objectness < confidence_threshold {
      continue;
    }

    let (class_label, class_score) = candidate[5..]
      .iter()
      .copied()
      .enumerate()
      .fold((0usize, f32::MIN), |best, (idx, score)| {
        if score > best.1 { (idx, score) } else { best }
      });

    let confidence = objectness * class_score;
    if confidence < confidence_threshold || confidence.is_nan() {
      continue;
    }

    let (cx, cy, w, h) = (candidate[0], candidate[1], candidate[2], candidate[3]);
    if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
      continue;
    }
    let (left, top) = affine.to_source(cx - w * 0.5, cy - h * 0.5);
    let (right, bottom) = affine.to_source(cx + w * 0.5, cy + h * 0.5);

    let left = left.clamp(0.0, img_w);
    let top = top.clamp(0.0, img_h);
    let right = right.clamp(left, img_w.max(left));
    let bottom = bottom.clamp(top, img_h.max(top));

    items.push(DetectedObject {
      left,
      top,
      right,
      bottom,
      confidence: confidence.min(1.0),
      class_label: class_label as u32,
    });
  }

  Ok(items)
}

/// 置信度过滤、NMS、按最大数量截断
pub fn postprocess(
  raw: &[f32],
  num_classes: usize,
  affine: &AffineMatrix,
  image_size: (usize, usize),
  config: &PostprocessConfig,
) -> Result<DetectResult> {
  let candidates = decode_candidates(
    raw,
    num_classes,
    affine,
    image_size,
    config.confidence_threshold,
  )?;
  let candidate_count = candidates.len();

  let mut items = config.nms_method.apply(candidates, config.nms_threshold);
  if items.len() > config.max_objects {
    items.sort_by(|a, b| {
      b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
    });
    items.truncate(config.max_objects);
  }

  debug!("候选框 {} 个, NMS 后保留 {} 个", candidate_count, items.len());
  Ok(DetectResult { items })
}
