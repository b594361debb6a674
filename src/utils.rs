use std::sync::{Mutex, MutexGuard, PoisonError};
#[cfg(feature = "v4l2")]
use tracing::info;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Auto-detect the first V4L2 capture device, preferring MJPEG
#[cfg(feature = "v4l2")]
pub fn auto_detect_device() -> Option<(String, crate::capture::PixelFormat)> {
    use crate::capture::PixelFormat;
    use std::path::Path;
    use v4l::{capability::Flags, video::Capture, Device, FourCC};

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            for fmt in formats {
                if fmt.fourcc == FourCC::new(b"MJPG") {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Some((path, PixelFormat::Mjpeg));
                } else if fmt.fourcc == FourCC::new(b"YUYV") {
                    info!("Found YUYV device: {} - {}", path, caps.card);
                    return Some((path, PixelFormat::Yuyv4));
                }
            }
        }
    }

    None
}
