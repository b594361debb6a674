//! Synthetic capture backend
//!
//! Produces a moving RGB gradient. Used as the last-resort fallback and to
//! run the service on machines without a camera.

use bytes::Bytes;

use super::backend::{CaptureBackend, CaptureDevice, CaptureRequest, Negotiated};
use super::frame::{PixelFormat, RawFrame};
use crate::error::{OpenError, ReadError};

/// Largest frame the generator will allocate
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

pub struct TestPatternBackend;

impl CaptureBackend for TestPatternBackend {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(
        &self,
        _path: &str,
        request: &CaptureRequest,
    ) -> Result<Box<dyn CaptureDevice>, OpenError> {
        if request.width == 0 || request.height == 0 {
            return Err(OpenError::Unsupported(format!(
                "{}x{} is not a valid resolution",
                request.width, request.height
            )));
        }
        if frame_bytes(request.width, request.height).is_none() {
            return Err(OpenError::Unsupported(format!(
                "{}x{} exceeds the test pattern frame limit",
                request.width, request.height
            )));
        }

        Ok(Box::new(TestPattern {
            negotiated: Negotiated {
                width: request.width,
                height: request.height,
                fps: request.fps,
                format: PixelFormat::Rgb24,
            },
            tick: 0,
        }))
    }
}

struct TestPattern {
    negotiated: Negotiated,
    tick: u32,
}

impl CaptureDevice for TestPattern {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        let Negotiated { width, height, .. } = self.negotiated;
        let mut data = Vec::with_capacity(frame_bytes(width, height).unwrap_or(0));

        for y in 0..height {
            for x in 0..width {
                data.push(x.wrapping_add(self.tick) as u8);
                data.push(y.wrapping_add(self.tick) as u8);
                data.push(self.tick as u8);
            }
        }
        self.tick = self.tick.wrapping_add(1);

        Ok(RawFrame {
            data: Bytes::from(data),
            width,
            height,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        })
    }
}

fn frame_bytes(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(3)
        .filter(|&bytes| bytes <= MAX_FRAME_BYTES)
}
