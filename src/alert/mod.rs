//! Purpose-built consumers: inference plus a cooldown-gated side effect

pub mod cooldown;
pub mod detector;
pub mod worker;

pub use cooldown::Cooldown;
pub use detector::{BBox, Detection, Detector};
pub use worker::{AlertRule, AlertStats, AlertWorker};
