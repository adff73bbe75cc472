// 该文件是 Dongfeng （东风） 项目的一部分。
// src/model.rs - 模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub mod nms;
pub mod postprocess;

pub use self::nms::NmsMethod;

/// 同步推理接口
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 检测到的目标，坐标为原图像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
  pub confidence: f32,
  pub class_label: u32,
}

impl DetectedObject {
  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  pub fn area(&self) -> f32 {
    self.width().max(0.0) * self.height().max(0.0)
  }

  pub fn iou(&self, other: &DetectedObject) -> f32 {
    let x1 = self.left.max(other.left);
    let y1 = self.top.max(other.top);
    let x2 = self.right.min(other.right);
    let y2 = self.bottom.min(other.bottom);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  pub fn center(&self) -> (f32, f32) {
    ((self.left + self.right) * 0.5, (self.top + self.bottom) * 0.5)
  }
}

pub type BoxArray = Vec<DetectedObject>;

/// 单帧检测结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: BoxArray,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectedObject> {
    self.items.iter()
  }
}

impl From<BoxArray> for DetectResult {
  fn from(items: BoxArray) -> Self {
    Self { items }
  }
}

/// 网络变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum YoloVariant {
  V5,
  X,
}

impl YoloVariant {
  pub fn type_name(&self) -> &'static str {
    match self {
      YoloVariant::V5 => "YoloV5",
      YoloVariant::X => "YoloX",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s.to_ascii_lowercase().as_str() {
      "v5" | "yolov5" => Some(YoloVariant::V5),
      "x" | "yolox" => Some(YoloVariant::X),
      _ => None,
    }
  }
}

/// 模型源文件中的网络描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescription {
  pub name: String,
  pub variant: YoloVariant,
  pub input_width: usize,
  pub input_height: usize,
  pub num_classes: usize,
  pub stride: usize,
}

impl NetworkDescription {
  pub fn load(path: &Path) -> Result<Self> {
    if !path.exists() {
      return Err(Error::Configuration(format!(
        "模型文件不存在: {}",
        path.display()
      )));
    }
    let text = std::fs::read_to_string(path)
      .map_err(|e| Error::Configuration(format!("无法读取模型文件 {}: {}", path.display(), e)))?;
    let desc: NetworkDescription = serde_json::from_str(&text)?;
    debug!(
      "网络描述: {} {} {}x{} 类别数 {}",
      desc.name,
      desc.variant.type_name(),
      desc.input_width,
      desc.input_height,
      desc.num_classes
    );
    Ok(desc)
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
    Ok(())
  }

  /// 每个候选框的输出长度: cx, cy, w, h, objectness, 各类别分数
  pub fn candidate_len(&self) -> usize {
    5 + self.num_classes
  }
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

pub fn label_name(class_label: u32) -> &'static str {
  COCO_CLASSES
    .get(class_label as usize)
    .copied()
    .unwrap_or("unknown")
}
