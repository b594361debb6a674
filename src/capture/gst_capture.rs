//! GStreamer-based capture with hardware-accelerated decoding

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::backend::{CaptureBackend, CaptureDevice, CaptureRequest, Negotiated};
use super::frame::{PixelFormat, RawFrame};
use crate::error::{OpenError, ReadError};

const PULL_TIMEOUT_MS: u64 = 1000;

pub struct GstBackend;

impl CaptureBackend for GstBackend {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn open(
        &self,
        path: &str,
        request: &CaptureRequest,
    ) -> Result<Box<dyn CaptureDevice>, OpenError> {
        gst::init().map_err(|e| OpenError::Backend(format!("failed to initialize GStreamer: {}", e)))?;

        let pipeline_str = build_pipeline_string(path, request)?;
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| OpenError::Backend(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| OpenError::Backend("failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| OpenError::Backend("failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| OpenError::Backend("failed to cast to AppSink".into()))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", true); // Drop old buffers if we can't keep up
        appsink.set_property("sync", false);

        // From here on the pipeline owns the device; Drop sets it to Null
        let device = GstDevice {
            pipeline,
            appsink,
            negotiated: Negotiated {
                width: request.width,
                height: request.height,
                fps: request.fps,
                format: PixelFormat::Rgb24, // Output is always RGB after conversion
            },
        };

        device
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| OpenError::Backend(format!("failed to start pipeline: {:?}", e)))?;

        let (state_change, _, _) = device.pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::Async) => {
                info!("Pipeline started");
                Ok(Box::new(device))
            }
            _ => Err(OpenError::Backend(format!("pipeline for {} did not start", path))),
        }
    }
}

/// Build optimized GStreamer pipeline string
fn build_pipeline_string(path: &str, request: &CaptureRequest) -> Result<String, OpenError> {
    let CaptureRequest {
        width, height, fps, ..
    } = *request;

    let pipeline = match request.format {
        PixelFormat::Mjpeg => {
            let jpeg_decoder = detect_jpeg_decoder();
            info!("Using JPEG decoder: {}", jpeg_decoder);
            format!(
                "v4l2src device={} name=source ! \
                 image/jpeg,width={},height={},framerate={}/1 ! \
                 queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
                 {} ! videoconvert ! video/x-raw,format=RGB ! appsink name=appsink",
                path, width, height, fps, jpeg_decoder
            )
        }
        PixelFormat::Yuyv4 => format!(
            "v4l2src device={} name=source ! \
             video/x-raw,format=YUY2,width={},height={},framerate={}/1 ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             videoconvert ! video/x-raw,format=RGB ! appsink name=appsink",
            path, width, height, fps
        ),
        PixelFormat::Rgb24 => format!(
            "v4l2src device={} name=source ! \
             video/x-raw,format=RGB,width={},height={},framerate={}/1 ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 ! \
             appsink name=appsink",
            path, width, height, fps
        ),
        other => {
            return Err(OpenError::Unsupported(format!(
                "pixel format {:?} over GStreamer",
                other
            )))
        }
    };

    Ok(pipeline)
}

/// Detect best available JPEG decoder (hardware > software)
fn detect_jpeg_decoder() -> &'static str {
    let decoders = ["nvjpegdec", "vaapijpegdec", "v4l2jpegdec", "jpegdec"];

    for decoder in &decoders {
        if gst::ElementFactory::find(decoder).is_some() {
            debug!("Found decoder: {}", decoder);
            return decoder;
        }
    }

    warn!("No hardware JPEG decoder found, using software decoder");
    "jpegdec"
}

struct GstDevice {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    negotiated: Negotiated,
}

impl CaptureDevice for GstDevice {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read_frame(&mut self) -> Result<RawFrame, ReadError> {
        if self.appsink.is_eos() {
            return Err(ReadError::Disconnected);
        }

        let sample = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
            .ok_or(ReadError::Timeout)?;

        let buffer = sample
            .buffer()
            .ok_or_else(|| ReadError::Backend("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| ReadError::Backend("failed to map buffer".into()))?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let caps = sample
            .caps()
            .ok_or_else(|| ReadError::Backend("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| ReadError::Backend("failed to parse video info from caps".into()))?;

        self.negotiated.width = info.width();
        self.negotiated.height = info.height();

        Ok(RawFrame {
            data,
            width: info.width(),
            height: info.height(),
            format: PixelFormat::Rgb24,
            device_timestamp: buffer.pts().map(|pts| pts.into()),
        })
    }
}

impl Drop for GstDevice {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}
