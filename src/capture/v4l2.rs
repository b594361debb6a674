//! V4L2 capture backend with memory-mapped buffers

use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::{CaptureBackend, CaptureDevice, CaptureRequest, Negotiated};
use super::frame::{PixelFormat, RawFrame};
use crate::error::{OpenError, ReadError};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Backend;

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    #[instrument(skip(self, request))]
    fn open(
        &self,
        path: &str,
        request: &CaptureRequest,
    ) -> Result<Box<dyn CaptureDevice>, OpenError> {
        let device = match path.parse::<usize>() {
            Ok(index) => Device::new(index)?,
            Err(_) => Device::with_path(path)?,
        };

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(OpenError::Unsupported(format!(
                "{} doesn't support video capture",
                path
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = match request.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            other => {
                return Err(OpenError::Unsupported(format!(
                    "pixel format {:?} over V4L2",
                    other
                )))
            }
        };
        let fmt = device.set_format(&fmt)?;

        let format = if fmt.fourcc == FourCC::new(b"MJPG") {
            PixelFormat::Mjpeg
        } else if fmt.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv4
        } else {
            return Err(OpenError::Unsupported(format!(
                "driver negotiated unsupported fourcc {}",
                fmt.fourcc
            )));
        };

        let mut fps = request.fps;
        if request.fps > 0 {
            let params = device.set_params(&Parameters::with_fps(request.fps))?;
            if params.interval.numerator > 0 {
                fps = params.interval.denominator / params.interval.numerator;
            }
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
        info!(
            "Capture stream started with {} buffers: {}x{} {:?} @ {} fps",
            BUFFER_COUNT, fmt.width, fmt.height, format, fps
        );

        Ok(Box::new(V4l2Device {
            stream,
            _device: device,
            negotiated: Negotiated {
                width: fmt.width,
                height: fmt.height,
                fps,
                format,
            },
        }))
    }
}

struct V4l2Device {
    // Declared before the device so buffers are unmapped first on drop
    stream: MmapStream<'static>,
    _device: Device,
    negotiated: Negotiated,
}

impl CaptureDevice for V4l2Device {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        let (buf, meta) = self.stream.next()?;

        if buf.is_empty() {
            return Err(ReadError::Backend("driver returned an empty buffer".into()));
        }

        Ok(RawFrame {
            data: Bytes::copy_from_slice(buf),
            width: self.negotiated.width,
            height: self.negotiated.height,
            format: self.negotiated.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        })
    }
}
