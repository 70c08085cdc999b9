//! Writer for version 3 `.ufmf` files.
//!
//! A ufmf file stores, for each frame, only the rectangular regions which
//! differ from a background model. The background itself is stored as
//! occasional full-size keyframes. An index of frame and keyframe locations is
//! written at the end of the file and its offset is patched into the header on
//! [UFMFWriter::close].

#[macro_use]
extern crate structure;

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};

use machine_vision_formats::{
    ImageStride,
    pixel_format::{Mono8, PixFmt},
};

mod save_indices;

pub type UFMFResult<M> = std::result::Result<M, UFMFError>;

#[derive(Debug, thiserror::Error)]
pub enum UFMFError {
    #[error("unimplemented pixel_format {0}")]
    UnimplementedPixelFormat(PixFmt),

    #[error("already closed")]
    AlreadyClosed,

    #[error(
        "box at ({x0}, {y0}) of size {w}x{h} exceeds frame size {max_width}x{max_height}"
    )]
    BoxOutOfBounds {
        x0: u16,
        y0: u16,
        w: u16,
        h: u16,
        max_width: u16,
        max_height: u16,
    },

    #[error("expected {expected} bytes of pixel data, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Cast(#[from] cast::Error),
}

const FORMAT_VERSION: u32 = 3;

const KEYFRAME_CHUNK: u8 = 0;
const FRAME_CHUNK: u8 = 1;
const INDEX_DICT_CHUNK: u8 = 2;

fn pack_header(v: u32, index_loc: u64, w: u16, h: u16, cl: u8) -> std::io::Result<Vec<u8>> {
    structure!("<4sIQHHB").pack(b"ufmf", v, index_loc, w, h, cl)
}

fn write_header<F: Write>(
    f: &mut F,
    index_loc: usize,
    max_width: u16,
    max_height: u16,
    pixel_format: PixFmt,
) -> UFMFResult<usize> {
    let coding = get_format(pixel_format)?;

    let buf: Vec<u8> = pack_header(
        FORMAT_VERSION,
        cast::u64(index_loc),
        max_width,
        max_height,
        cast::u8(coding.len())?,
    )?;

    f.write_all(&buf)?;
    f.write_all(coding)?;
    Ok(buf.len() + coding.len())
}

fn get_format(pixel_format: PixFmt) -> UFMFResult<&'static [u8]> {
    match pixel_format {
        PixFmt::Mono8 => Ok(b"MONO8"),
        f => Err(UFMFError::UnimplementedPixelFormat(f)),
    }
}

fn write_image<F: Write>(
    f: &mut F,
    frame: &dyn ImageStride<Mono8>,
    width: usize,
    height: usize,
) -> UFMFResult<usize> {
    let image_data = frame.image_data();
    let stride = frame.stride();
    let mut pos = 0;
    for i in 0..height {
        let start = i * stride;
        let row_data = image_data
            .get(start..start + width)
            .ok_or(UFMFError::PayloadSize {
                expected: start + width,
                actual: image_data.len(),
            })?;
        f.write_all(row_data)?;
        pos += width;
    }
    Ok(pos)
}

/// A rectangular region, specified from its upper-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectFromCorner {
    pub x0: u16,
    pub y0: u16,
    pub w: u16,
    pub h: u16,
}

impl RectFromCorner {
    pub fn new(x0: u16, y0: u16, w: u16, h: u16) -> Self {
        Self { x0, y0, w, h }
    }
}

/// A foreground region and its pixels, stored row-major without padding.
#[derive(Debug, Clone, Copy)]
pub struct BoxRef<'a> {
    pub rect: RectFromCorner,
    pub pixels: &'a [u8],
}

struct TimestampLoc {
    timestamp: f64,
    loc: u64,
}

pub struct UFMFWriter<F: Write + Seek> {
    f: Option<F>,
    pos: usize,
    max_width: u16,
    max_height: u16,
    index_frame: Vec<TimestampLoc>,
    index_keyframes: BTreeMap<Vec<u8>, Vec<TimestampLoc>>,
    bytes_per_pixel: usize,
    pixel_format: PixFmt,
}

impl<F: Write + Seek> std::fmt::Debug for UFMFWriter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UFMFWriter")
            .field("max_width", &self.max_width)
            .field("max_height", &self.max_height)
            .field("pixel_format", &self.pixel_format)
            .field("n_frames", &self.index_frame.len())
            .finish_non_exhaustive()
    }
}

impl<F> UFMFWriter<F>
where
    F: Write + Seek,
{
    /// Write the file header and return a writer for frames and keyframes.
    pub fn new(mut f: F, max_width: u16, max_height: u16, pixel_format: PixFmt) -> UFMFResult<Self> {
        let pos = write_header(&mut f, 0, max_width, max_height, pixel_format)?;
        let bytes_per_pixel = usize::from(pixel_format.bits_per_pixel() / 8);

        Ok(Self {
            f: Some(f),
            pos,
            max_width,
            max_height,
            index_frame: Vec::new(),
            index_keyframes: BTreeMap::new(),
            bytes_per_pixel,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixFmt {
        self.pixel_format
    }

    /// Number of frame chunks written so far.
    pub fn frame_count(&self) -> usize {
        self.index_frame.len()
    }

    /// Append a frame chunk containing `boxes`. An empty slice records a frame
    /// identical to the background.
    pub fn add_frame(&mut self, timestamp: f64, boxes: &[BoxRef]) -> UFMFResult<()> {
        // Validate everything before writing so a bad box cannot leave a
        // partial chunk in the file.
        for b in boxes {
            let r = &b.rect;
            if u32::from(r.x0) + u32::from(r.w) > u32::from(self.max_width)
                || u32::from(r.y0) + u32::from(r.h) > u32::from(self.max_height)
            {
                return Err(UFMFError::BoxOutOfBounds {
                    x0: r.x0,
                    y0: r.y0,
                    w: r.w,
                    h: r.h,
                    max_width: self.max_width,
                    max_height: self.max_height,
                });
            }
            let expected = usize::from(r.w) * usize::from(r.h) * self.bytes_per_pixel;
            if b.pixels.len() != expected {
                return Err(UFMFError::PayloadSize {
                    expected,
                    actual: b.pixels.len(),
                });
            }
        }
        let n_pts = cast::u16(boxes.len())?;

        let f = self.f.as_mut().ok_or(UFMFError::AlreadyClosed)?;

        self.index_frame.push(TimestampLoc {
            timestamp,
            loc: cast::u64(self.pos),
        });

        let buf = structure!("<dH").pack(timestamp, n_pts)?;
        f.write_all(&[FRAME_CHUNK])?;
        f.write_all(&buf)?;
        self.pos += 1 + buf.len();

        for b in boxes {
            let head = structure!("<HHHH").pack(b.rect.x0, b.rect.y0, b.rect.w, b.rect.h)?;
            f.write_all(&head)?;
            f.write_all(b.pixels)?;
            self.pos += head.len() + b.pixels.len();
        }
        Ok(())
    }

    /// Append a full-frame keyframe chunk of the given type (e.g. `b"mean"`).
    pub fn add_keyframe(
        &mut self,
        keyframe_type: &[u8],
        timestamp: f64,
        frame: &dyn ImageStride<Mono8>,
    ) -> UFMFResult<()> {
        let type_len = cast::u8(keyframe_type.len())?;
        let width = cast::u16(frame.width())?;
        let height = cast::u16(frame.height())?;
        let f = self.f.as_mut().ok_or(UFMFError::AlreadyClosed)?;

        self.index_keyframes
            .entry(keyframe_type.to_vec())
            .or_default()
            .push(TimestampLoc {
                timestamp,
                loc: cast::u64(self.pos),
            });

        f.write_all(&[KEYFRAME_CHUNK, type_len])?;
        f.write_all(keyframe_type)?;
        let buf = structure!("<BHHd").pack(b'B', width, height, timestamp)?;
        f.write_all(&buf)?;
        self.pos += 2 + keyframe_type.len() + buf.len();
        self.pos += write_image(f, frame, usize::from(width), usize::from(height))?;
        Ok(())
    }

    /// Close the writer.
    ///
    /// Ideally, this is called prior to dropping to prevent the possibility of
    /// silently ignoring errors.
    pub fn close(&mut self) -> UFMFResult<F> {
        let mut f = self.f.take().ok_or(UFMFError::AlreadyClosed)?;

        f.write_all(&[INDEX_DICT_CHUNK])?;
        self.pos += 1;
        // The header points just past the chunk identifier.
        let index_loc = self.pos;
        self.pos += save_indices::save_indices(&mut f, &self.index_frame, &self.index_keyframes)?;
        f.seek(SeekFrom::Start(0))?;
        write_header(
            &mut f,
            index_loc,
            self.max_width,
            self.max_height,
            self.pixel_format,
        )?;
        f.seek(SeekFrom::End(0))?;
        f.flush()?;
        Ok(f)
    }
}

/// This will silently ignore any error.
impl<F: Write + Seek> Drop for UFMFWriter<F> {
    fn drop(&mut self) {
        if self.f.is_some() {
            let _ = self.close();
        }
    }
}
