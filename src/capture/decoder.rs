use zune_jpeg::JpegDecoder;

use super::frame::PixelFormat;
use crate::error::DetectError;

/// Convert a frame payload to packed RGB24.
///
/// Returns `None` when the payload already is RGB24 so callers can reuse the
/// shared buffer instead of copying it.
pub fn decode_rgb(data: &[u8], format: PixelFormat) -> Result<Option<Vec<u8>>, DetectError> {
    match format {
        PixelFormat::Rgb24 => Ok(None),
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            decoder
                .decode()
                .map(Some)
                .map_err(|e| DetectError::Decode(format!("{:?}", e)))
        }
        PixelFormat::Bgr24 => {
            let mut rgb = Vec::with_capacity(data.len());
            for chunk in data.chunks_exact(3) {
                rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
            }
            Ok(Some(rgb))
        }
        PixelFormat::Yuyv4 => Ok(Some(yuyv_to_rgb(data))),
        PixelFormat::Nv12 => Err(DetectError::Decode(
            "NV12 to RGB conversion is not supported".into(),
        )),
    }
}

// BT.601, two pixels per 4-byte macropixel
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(4) {
        let (y0, u, y1, v) = (px[0] as f32, px[1] as f32 - 128.0, px[2] as f32, px[3] as f32 - 128.0);
        for y in [y0, y1] {
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_passes_through() {
        assert!(decode_rgb(&[1, 2, 3], PixelFormat::Rgb24).unwrap().is_none());
    }

    #[test]
    fn bgr_is_swapped() {
        let rgb = decode_rgb(&[1, 2, 3, 4, 5, 6], PixelFormat::Bgr24)
            .unwrap()
            .unwrap();
        assert_eq!(rgb, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn yuyv_grey_stays_grey() {
        let rgb = decode_rgb(&[128, 128, 64, 128], PixelFormat::Yuyv4)
            .unwrap()
            .unwrap();
        assert_eq!(rgb, vec![128, 128, 128, 64, 64, 64]);
    }

    #[test]
    fn garbage_jpeg_is_a_decode_error() {
        let err = decode_rgb(&[0, 1, 2, 3], PixelFormat::Mjpeg).unwrap_err();
        assert!(matches!(err, DetectError::Decode(_)));
    }
}
