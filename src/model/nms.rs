// 该文件是 Dongfeng （东风） 项目的一部分。
// src/model/nms.rs - 非极大值抑制
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 两种 NMS 策略：
//!
//! - [`NmsMethod::Reference`]：按置信度降序的贪心抑制，结果精确，用于评估 mAP
//! - [`NmsMethod::Accelerated`]：Fast NMS，每个框只检查比它置信度更高的同类框，
//!   不管那些框自己是否已被抑制，因此可以并行计算
//!
//! 两者的差别只出现在“链式”重叠中：A 抑制 B，B 与 C 重叠超过阈值而 A 与 C 不重叠时，
//! Reference 保留 C，Accelerated 丢弃 C。Accelerated 的结果总是 Reference 结果的子集。

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::DetectedObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NmsMethod {
  Reference,
  #[default]
  Accelerated,
}

impl NmsMethod {
  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "cpu" | "reference" | "ref" => Some(NmsMethod::Reference),
      "fast" | "gpu" | "fastgpu" | "accelerated" => Some(NmsMethod::Accelerated),
      _ => None,
    }
  }

  pub fn apply(&self, detections: Vec<DetectedObject>, iou_threshold: f32) -> Vec<DetectedObject> {
    match self {
      NmsMethod::Reference => reference_nms(detections, iou_threshold),
      NmsMethod::Accelerated => fast_nms(detections, iou_threshold),
    }
  }
}

fn by_confidence_desc(a: &DetectedObject, b: &DetectedObject) -> Ordering {
  b.confidence
    .partial_cmp(&a.confidence)
    .unwrap_or(Ordering::Equal)
}

/// 贪心 NMS
pub fn reference_nms(
  mut detections: Vec<DetectedObject>,
  iou_threshold: f32,
) -> Vec<DetectedObject> {
  detections.sort_by(by_confidence_desc);

  let mut removed = vec![false; detections.len()];
  let mut result = Vec::new();

  for i in 0..detections.len() {
    if removed[i] {
      continue;
    }
    let best = detections[i];
    result.push(best);

    for j in (i + 1)..detections.len() {
      if removed[j] || detections[j].class_label != best.class_label {
        continue;
      }
      if best.iou(&detections[j]) > iou_threshold {
        removed[j] = true;
      }
    }
  }

  result
}

/// Fast NMS
pub fn fast_nms(mut detections: Vec<DetectedObject>, iou_threshold: f32) -> Vec<DetectedObject> {
  detections.sort_by(by_confidence_desc);

  let keep: Vec<bool> = (0..detections.len())
    .into_par_iter()
    .map(|j| {
      let current = &detections[j];
      !detections[..j].iter().any(|higher| {
        higher.class_label == current.class_label && higher.iou(current) > iou_threshold
      })
    })
    .collect();

  detections
    .into_iter()
    .zip(keep)
    .filter_map(|(det, keep)| keep.then_some(det))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn obj(left: f32, right: f32, confidence: f32, class_label: u32) -> DetectedObject {
    DetectedObject {
      left,
      top: 0.0,
      right,
      bottom: 10.0,
      confidence,
      class_label,
    }
  }

  #[test]
  fn overlapping_boxes_of_the_same_class_are_suppressed() {
    let dets = vec![obj(0.0, 10.0, 0.6, 0), obj(1.0, 11.0, 0.9, 0)];
    for method in [NmsMethod::Reference, NmsMethod::Accelerated] {
      let kept = method.apply(dets.clone(), 0.45);
      assert_eq!(kept.len(), 1);
      assert_eq!(kept[0].confidence, 0.9);
    }
  }

  #[test]
  fn different_classes_are_not_suppressed() {
    let dets = vec![obj(0.0, 10.0, 0.9, 0), obj(0.0, 10.0, 0.8, 1)];
    for method in [NmsMethod::Reference, NmsMethod::Accelerated] {
      assert_eq!(method.apply(dets.clone(), 0.45).len(), 2);
    }
  }

  #[test]
  fn chained_overlap_is_the_only_difference() {
    // A 与 B 的 IoU 为 0.6，B 与 C 为 0.6，A 与 C 约为 0.33
    let a = obj(0.0, 10.0, 0.9, 0);
    let b = obj(2.5, 12.5, 0.8, 0);
    let c = obj(5.0, 15.0, 0.7, 0);
    let dets = vec![c, a, b];

    let reference = reference_nms(dets.clone(), 0.5);
    let fast = fast_nms(dets, 0.5);

    assert_eq!(reference, vec![a, c]);
    assert_eq!(fast, vec![a]);
  }

  #[test]
  fn accelerated_is_a_subset_of_reference() {
    let dets: Vec<_> = (0..40)
      .map(|i| obj(i as f32 * 1.7, i as f32 * 1.7 + 10.0, 1.0 - i as f32 * 0.01, i % 3))
      .collect();
    let reference = reference_nms(dets.clone(), 0.45);
    let fast = fast_nms(dets, 0.45);
    assert!(fast.len() <= reference.len());
    assert!(fast.iter().all(|f| reference.contains(f)));
  }

  #[test]
  fn parse_method_names() {
    assert_eq!(NmsMethod::parse("cpu"), Some(NmsMethod::Reference));
    assert_eq!(NmsMethod::parse("FastGPU"), Some(NmsMethod::Accelerated));
    assert_eq!(NmsMethod::parse("other"), None);
  }
}
