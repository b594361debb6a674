pub mod backend;
pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod test_pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use backend::{BackendCatalog, CaptureBackend, CaptureDevice, CaptureRequest, DeviceSpec, Negotiated};
pub use frame::{Frame, FrameMetadata, FrameView, PixelFormat, RawFrame};
