//! Inference boundary
//!
//! The model itself lives outside this crate. Callers hand in anything that
//! turns a decoded frame view into detections; results are neither retried
//! nor cached here.

use serde::{Deserialize, Serialize};

use crate::capture::FrameView;
use crate::error::DetectError;

/// Axis-aligned box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: BBox,
}

pub trait Detector: Send {
    fn detect(&mut self, frame: FrameView<'_>) -> Result<Vec<Detection>, DetectError>;
}

impl<F> Detector for F
where
    F: FnMut(FrameView<'_>) -> Result<Vec<Detection>, DetectError> + Send,
{
    fn detect(&mut self, frame: FrameView<'_>) -> Result<Vec<Detection>, DetectError> {
        self(frame)
    }
}
