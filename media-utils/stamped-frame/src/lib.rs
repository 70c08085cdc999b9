//! Image buffers as produced by a camera and the per-frame metadata attached
//! to them by the grabber.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use machine_vision_formats::{
    ImageData, Stride,
    owned::OImage,
    pixel_format::{Mono8, PixFmt, RGB8},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image buffer too small: {width}x{height} with stride {stride}, got {actual} bytes")]
    BufferTooSmall {
        width: u32,
        height: u32,
        stride: usize,
        actual: usize,
    },
    #[error("stride {stride} is smaller than a row of {row_bytes} bytes")]
    InvalidStride { stride: usize, row_bytes: usize },
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixFmt),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An owned image buffer whose pixel format is known at runtime.
#[derive(Clone, Debug)]
pub enum Image {
    Mono8(OImage<Mono8>),
    RGB8(OImage<RGB8>),
}

macro_rules! match_all {
    ($im:expr, $x:ident, $block:expr) => {
        match $im {
            Image::Mono8($x) => $block,
            Image::RGB8($x) => $block,
        }
    };
}

impl Image {
    pub fn new(
        width: u32,
        height: u32,
        stride: usize,
        pixel_format: PixFmt,
        data: Vec<u8>,
    ) -> Result<Self> {
        let row_bytes = width as usize * usize::from(pixel_format.bits_per_pixel()) / 8;
        if stride < row_bytes {
            return Err(Error::InvalidStride { stride, row_bytes });
        }
        let actual = data.len();
        let too_small = Error::BufferTooSmall {
            width,
            height,
            stride,
            actual,
        };
        match pixel_format {
            PixFmt::Mono8 => Ok(Image::Mono8(
                OImage::new(width, height, stride, data).ok_or(too_small)?,
            )),
            PixFmt::RGB8 => Ok(Image::RGB8(
                OImage::new(width, height, stride, data).ok_or(too_small)?,
            )),
            other => Err(Error::UnsupportedFormat(other)),
        }
    }

    /// A tightly packed 8 bit monochrome image.
    pub fn mono8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, width as usize, PixFmt::Mono8, data)
    }

    /// An 8 bit monochrome image with every pixel set to `value`.
    pub fn filled_mono8(width: u32, height: u32, value: u8) -> Result<Self> {
        Self::mono8(width, height, vec![value; width as usize * height as usize])
    }

    pub fn width(&self) -> u32 {
        match_all!(self, x, x.width())
    }

    pub fn height(&self) -> u32 {
        match_all!(self, x, x.height())
    }

    /// Number of bytes from the start of one row to the start of the next.
    pub fn stride(&self) -> usize {
        match_all!(self, x, x.stride())
    }

    pub fn pixel_format(&self) -> PixFmt {
        match self {
            Image::Mono8(_) => PixFmt::Mono8,
            Image::RGB8(_) => PixFmt::RGB8,
        }
    }

    /// Raw buffer including any stride padding.
    pub fn image_data_without_format(&self) -> &[u8] {
        match_all!(self, x, x.image_data())
    }

    pub fn as_mono8(&self) -> Option<&OImage<Mono8>> {
        match self {
            Image::Mono8(x) => Some(x),
            _ => None,
        }
    }
}

/// A captured image with its acquisition metadata.
///
/// Cloning is cheap: the pixel buffer is shared and never mutated after
/// stamping.
#[derive(Debug, Clone)]
pub struct StampedFrame {
    pub image: Arc<Image>,
    /// Strictly increasing within a capture session, starting at 0.
    pub frame_count: u64,
    /// Seconds on a monotonic clock since capture started.
    pub timestamp: f64,
    /// Wall clock time at which the frame was received.
    pub host_timestamp: DateTime<Utc>,
}

impl StampedFrame {
    pub fn new(image: Image, frame_count: u64, timestamp: f64, host_timestamp: DateTime<Utc>) -> Self {
        Self {
            image: Arc::new(image),
            frame_count,
            timestamp,
            host_timestamp,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel_format(&self) -> PixFmt {
        self.image.pixel_format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_rows() {
        let data: Vec<u8> = (0..12).collect();
        let im = Image::new(3, 3, 4, PixFmt::Mono8, data).unwrap();
        let mono = im.as_mono8().unwrap();
        let rows: Vec<&[u8]> = mono
            .image_data()
            .chunks(mono.stride())
            .map(|row| &row[..3])
            .collect();
        assert_eq!(rows, vec![&[0, 1, 2][..], &[4, 5, 6], &[8, 9, 10]]);
    }

    #[test]
    fn test_buffer_validation() {
        assert!(matches!(
            Image::mono8(4, 4, vec![0; 15]),
            Err(Error::BufferTooSmall { actual: 15, .. })
        ));
        assert!(matches!(
            Image::new(4, 4, 3, PixFmt::Mono8, vec![0; 16]),
            Err(Error::InvalidStride { .. })
        ));
        // The last row does not need stride padding.
        assert!(Image::new(3, 2, 4, PixFmt::Mono8, vec![0; 7]).is_ok());
        // RGB8 rows are three bytes per pixel.
        assert!(matches!(
            Image::new(2, 1, 4, PixFmt::RGB8, vec![0; 6]),
            Err(Error::InvalidStride { row_bytes: 6, .. })
        ));
        assert!(matches!(
            Image::new(2, 2, 8, PixFmt::Mono32f, vec![0; 16]),
            Err(Error::UnsupportedFormat(PixFmt::Mono32f))
        ));
    }

    #[test]
    fn test_format_dispatch() {
        let rgb = Image::new(2, 2, 6, PixFmt::RGB8, vec![0; 12]).unwrap();
        assert_eq!(rgb.pixel_format(), PixFmt::RGB8);
        assert_eq!(rgb.stride(), 6);
        assert!(rgb.as_mono8().is_none());
        let mono = Image::filled_mono8(3, 2, 9).unwrap();
        assert_eq!(mono.image_data_without_format(), &[9; 6]);
    }

    #[test]
    fn test_clone_shares_pixels() {
        let frame = StampedFrame::new(Image::filled_mono8(8, 8, 7).unwrap(), 0, 0.0, Utc::now());
        let copy = frame.clone();
        assert!(Arc::ptr_eq(&frame.image, &copy.image));
        assert_eq!(copy.width(), 8);
    }
}
