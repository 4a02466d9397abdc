//! Frame type and face-crop extraction for unknown-face captures.

use crate::types::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use std::fmt;

/// Padding added on every side of a face box before cropping.
pub const CROP_PADDING: u32 = 20;

/// JPEG quality for stored face crops.
const CROP_JPEG_QUALITY: u8 = 90;

/// A sampled grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Pixel rectangle inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap raw grayscale bytes, checking the buffer matches the dimensions.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Copy out a sub-rectangle. The region must lie inside the frame.
    pub fn crop(&self, region: CropRegion) -> Result<Frame, FrameError> {
        if region.width == 0
            || region.height == 0
            || region.x.checked_add(region.width).map_or(true, |end| end > self.width)
            || region.y.checked_add(region.height).map_or(true, |end| end > self.height)
        {
            return Err(FrameError::RegionOutOfBounds(region));
        }

        let w = self.width as usize;
        let mut data = Vec::with_capacity(region.width as usize * region.height as usize);
        for row in region.y..region.y + region.height {
            let start = row as usize * w + region.x as usize;
            data.extend_from_slice(&self.data[start..start + region.width as usize]);
        }

        Ok(Frame {
            data,
            width: region.width,
            height: region.height,
        })
    }

    /// Encode the frame as a grayscale JPEG.
    pub fn encode_jpeg(&self) -> Result<Vec<u8>, FrameError> {
        let img = GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: self.width as usize * self.height as usize,
                actual: self.data.len(),
            },
        )?;

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, CROP_JPEG_QUALITY).encode_image(&img)?;
        Ok(out)
    }

    /// Crop the face in `bbox` with `padding` pixels of context and encode it.
    pub fn capture_face(&self, bbox: &BoundingBox, padding: u32) -> Result<Vec<u8>, FrameError> {
        let region = padded_crop_region(bbox, self.width, self.height, padding)
            .ok_or(FrameError::FaceOutsideFrame)?;
        self.crop(region)?.encode_jpeg()
    }
}

/// Grow `bbox` by `padding` on each side and clamp it to the frame.
///
/// Returns `None` when nothing of the box overlaps the frame.
pub fn padded_crop_region(
    bbox: &BoundingBox,
    frame_width: u32,
    frame_height: u32,
    padding: u32,
) -> Option<CropRegion> {
    if !(bbox.x.is_finite() && bbox.y.is_finite() && bbox.width.is_finite() && bbox.height.is_finite())
    {
        return None;
    }

    let pad = padding as f32;
    let x0 = (bbox.x.floor() - pad).clamp(0.0, frame_width as f32) as u32;
    let y0 = (bbox.y.floor() - pad).clamp(0.0, frame_height as f32) as u32;
    let x1 = ((bbox.x + bbox.width).ceil() + pad).clamp(0.0, frame_width as f32) as u32;
    let y1 = ((bbox.y + bbox.height).ceil() + pad).clamp(0.0, frame_height as f32) as u32;

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(CropRegion {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("crop region {0:?} exceeds frame bounds")]
    RegionOutOfBounds(CropRegion),
    #[error("face bounding box lies outside the frame")]
    FaceOutsideFrame,
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_padded_region_interior() {
        let region = padded_crop_region(&bbox(50.0, 50.0, 100.0, 100.0), 400, 400, CROP_PADDING);
        assert_eq!(
            region,
            Some(CropRegion { x: 30, y: 30, width: 140, height: 140 })
        );
    }

    #[test]
    fn test_padded_region_clamped_at_origin() {
        let region = padded_crop_region(&bbox(5.0, 10.0, 100.0, 100.0), 400, 400, CROP_PADDING);
        assert_eq!(
            region,
            Some(CropRegion { x: 0, y: 0, width: 125, height: 130 })
        );
    }

    #[test]
    fn test_padded_region_clamped_at_far_edge() {
        let region = padded_crop_region(&bbox(350.0, 360.0, 40.0, 40.0), 400, 400, CROP_PADDING);
        assert_eq!(
            region,
            Some(CropRegion { x: 330, y: 340, width: 70, height: 60 })
        );
    }

    #[test]
    fn test_padded_region_outside_frame() {
        assert_eq!(padded_crop_region(&bbox(500.0, 500.0, 10.0, 10.0), 400, 400, 20), None);
        assert_eq!(padded_crop_region(&bbox(f32::NAN, 0.0, 10.0, 10.0), 400, 400, 20), None);
    }

    #[test]
    fn test_frame_new_checks_length() {
        assert!(Frame::new(vec![0; 12], 4, 3).is_ok());
        assert!(matches!(
            Frame::new(vec![0; 11], 4, 3),
            Err(FrameError::InvalidLength { expected: 12, actual: 11 })
        ));
    }

    #[test]
    fn test_crop_copies_rows() {
        // 4x3 frame with pixel value = index
        let frame = Frame::new((0..12).collect(), 4, 3).unwrap();
        let crop = frame
            .crop(CropRegion { x: 1, y: 1, width: 2, height: 2 })
            .unwrap();
        assert_eq!(crop.width, 2);
        assert_eq!(crop.height, 2);
        assert_eq!(crop.data, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_crop_rejects_out_of_bounds() {
        let frame = Frame::new(vec![0; 16], 4, 4).unwrap();
        let result = frame.crop(CropRegion { x: 3, y: 0, width: 2, height: 2 });
        assert!(matches!(result, Err(FrameError::RegionOutOfBounds(_))));
    }

    #[test]
    fn test_crop_rejects_wrapping_region() {
        let frame = Frame::new(vec![0; 16], 4, 4).unwrap();
        let wide = frame.crop(CropRegion { x: u32::MAX, y: 0, width: 2, height: 1 });
        assert!(matches!(wide, Err(FrameError::RegionOutOfBounds(_))));
        let tall = frame.crop(CropRegion { x: 0, y: 1, width: 1, height: u32::MAX });
        assert!(matches!(tall, Err(FrameError::RegionOutOfBounds(_))));
    }

    #[test]
    fn test_capture_face_produces_jpeg() {
        let frame = Frame::new(vec![128u8; 400 * 400], 400, 400).unwrap();
        let jpeg = frame
            .capture_face(&bbox(50.0, 50.0, 100.0, 100.0), CROP_PADDING)
            .unwrap();
        // JPEG SOI marker
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_capture_face_outside_frame() {
        let frame = Frame::new(vec![0u8; 64], 8, 8).unwrap();
        let result = frame.capture_face(&bbox(100.0, 100.0, 4.0, 4.0), CROP_PADDING);
        assert!(matches!(result, Err(FrameError::FaceOutsideFrame)));
    }
}
