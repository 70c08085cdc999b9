//! Foreground extraction against a background model.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use machine_vision_formats::{ImageStride, pixel_format::Mono8};
use parking_lot::{Condvar, Mutex};
use pipeline_sync::SynchronizedQueue;
use stamped_frame::StampedFrame;
use tracing::debug;

use crate::{Error, Result, WORKER_POLL_INTERVAL, background::BackgroundModel};

/// A rectangular region of a frame and its pixels, row-major without padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundBox {
    pub x0: u16,
    pub y0: u16,
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u8>,
}

/// The foreground of one frame.
#[derive(Debug, Clone)]
pub struct CompressedFrame {
    pub frame_count: u64,
    pub timestamp: f64,
    /// Empty if the whole frame matched the background.
    pub boxes: Vec<ForegroundBox>,
    /// The model this frame was compared against.
    pub background: Arc<BackgroundModel>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressParams {
    /// Maximum box side length. Zero means unlimited.
    pub box_length: u32,
    /// Dilation window size. Zero disables dilation.
    pub dilate_window: u32,
}

pub(crate) struct CompressTask {
    pub(crate) frame: StampedFrame,
    pub(crate) background: Arc<BackgroundModel>,
}

/// Compare `frame` against `background` and collect the foreground boxes.
///
/// Foreground pixels are those outside the model's bounds. The mask is
/// optionally dilated, split into 8-connected components, and each
/// component's bounding box is saved (as tiles if `box_length` is set).
pub fn compress_frame(
    frame: &StampedFrame,
    background: &Arc<BackgroundModel>,
    params: &CompressParams,
) -> Result<CompressedFrame> {
    let image: &dyn ImageStride<Mono8> = frame.image.as_mono8().ok_or_else(|| {
        Error::Format(format!(
            "frame {} has pixel format {}",
            frame.frame_count,
            frame.pixel_format()
        ))
    })?;
    let width = image.width();
    let height = image.height();
    if width != background.width() || height != background.height() {
        return Err(Error::Format(format!(
            "frame {} is {}x{} but background is {}x{}",
            frame.frame_count,
            width,
            height,
            background.width(),
            background.height()
        )));
    }
    let w = width as usize;
    let h = height as usize;

    let image_data = image.image_data();
    let stride = image.stride();
    let row_of = |y: usize| &image_data[y * stride..y * stride + w];

    let lower = background.lower();
    let upper = background.upper();
    let mut mask = vec![false; w * h];
    for y in 0..h {
        let row = row_of(y);
        for x in 0..w {
            let i = y * w + x;
            mask[i] = row[x] < lower[i] || row[x] > upper[i];
        }
    }

    if params.dilate_window >= 3 {
        mask = dilate(&mask, w, h, params.dilate_window as usize / 2);
    }

    let mut boxes = Vec::new();
    for (x0, y0, x1, y1) in component_bounds(&mask, w, h) {
        for (tx0, ty0, tx1, ty1) in tiles(x0, y0, x1, y1, params.box_length as usize) {
            if !any_set(&mask, w, tx0, ty0, tx1, ty1) {
                continue;
            }
            let mut pixels = Vec::with_capacity((tx1 - tx0 + 1) * (ty1 - ty0 + 1));
            for y in ty0..=ty1 {
                pixels.extend_from_slice(&row_of(y)[tx0..=tx1]);
            }
            boxes.push(ForegroundBox {
                x0: cast::u16(tx0)?,
                y0: cast::u16(ty0)?,
                width: cast::u16(tx1 - tx0 + 1)?,
                height: cast::u16(ty1 - ty0 + 1)?,
                pixels,
            });
        }
    }

    Ok(CompressedFrame {
        frame_count: frame.frame_count,
        timestamp: frame.timestamp,
        boxes,
        background: background.clone(),
    })
}

/// Binary dilation with a square window of radius `r`, as two separable
/// passes.
fn dilate(mask: &[bool], w: usize, h: usize, r: usize) -> Vec<bool> {
    let mut horizontal = vec![false; w * h];
    for y in 0..h {
        let row = &mask[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(r);
            let hi = (x + r).min(w - 1);
            horizontal[y * w + x] = row[lo..=hi].iter().any(|&m| m);
        }
    }
    let mut out = vec![false; w * h];
    for y in 0..h {
        let lo = y.saturating_sub(r);
        let hi = (y + r).min(h - 1);
        for x in 0..w {
            out[y * w + x] = (lo..=hi).any(|yy| horizontal[yy * w + x]);
        }
    }
    out
}

/// Inclusive bounding boxes `(x0, y0, x1, y1)` of the 8-connected components
/// of `mask`, ordered by the first pixel of each component in raster order.
fn component_bounds(mask: &[bool], w: usize, h: usize) -> Vec<(usize, usize, usize, usize)> {
    let mut visited = vec![false; w * h];
    let mut result = Vec::new();
    let mut stack = Vec::new();
    for start in 0..w * h {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let (mut x0, mut y0) = (start % w, start / w);
        let (mut x1, mut y1) = (x0, y0);
        while let Some(i) = stack.pop() {
            let x = i % w;
            let y = i / w;
            x0 = x0.min(x);
            x1 = x1.max(x);
            y0 = y0.min(y);
            y1 = y1.max(y);
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let j = ny * w + nx;
                    if mask[j] && !visited[j] {
                        visited[j] = true;
                        stack.push(j);
                    }
                }
            }
        }
        result.push((x0, y0, x1, y1));
    }
    result
}

/// Split an inclusive rectangle into tiles of at most `len` on a side.
fn tiles(
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
    len: usize,
) -> Vec<(usize, usize, usize, usize)> {
    if len == 0 {
        return vec![(x0, y0, x1, y1)];
    }
    let mut result = Vec::new();
    for ty in (y0..=y1).step_by(len) {
        for tx in (x0..=x1).step_by(len) {
            result.push((tx, ty, (tx + len - 1).min(x1), (ty + len - 1).min(y1)));
        }
    }
    result
}

fn any_set(mask: &[bool], w: usize, x0: usize, y0: usize, x1: usize, y1: usize) -> bool {
    (y0..=y1).any(|y| mask[y * w + x0..=y * w + x1].iter().any(|&m| m))
}

/// Compressed frames waiting to be written, keyed by frame number.
///
/// Compressors finish out of order. The serializer takes frames out in the
/// order they were submitted.
#[derive(Default)]
pub(crate) struct FinishedFrames {
    frames: Mutex<BTreeMap<u64, CompressedFrame>>,
    inserted: Condvar,
}

impl FinishedFrames {
    pub(crate) fn insert(&self, frame: CompressedFrame) {
        self.frames.lock().insert(frame.frame_count, frame);
        self.inserted.notify_all();
    }

    pub(crate) fn take(&self, frame_count: u64) -> Option<CompressedFrame> {
        self.frames.lock().remove(&frame_count)
    }

    /// Wait up to `timeout` for `frame_count` to be inserted.
    pub(crate) fn wait_take(&self, frame_count: u64, timeout: Duration) -> Option<CompressedFrame> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        loop {
            if let Some(frame) = frames.remove(&frame_count) {
                return Some(frame);
            }
            if self.inserted.wait_until(&mut frames, deadline).timed_out() {
                return frames.remove(&frame_count);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.frames.lock().clear();
    }
}

pub(crate) fn compressor_worker(
    todo: Arc<SynchronizedQueue<CompressTask>>,
    finished: Arc<FinishedFrames>,
    params: CompressParams,
    compressed: Arc<AtomicU64>,
    flag: thread_control::Flag,
    err_tx: Sender<Error>,
) {
    loop {
        // Pending work is completed even after a stop request.
        let Some(task) = todo.pop_timeout(WORKER_POLL_INTERVAL) else {
            if !flag.is_alive() {
                break;
            }
            continue;
        };
        let frame = thread_try!(err_tx, compress_frame(&task.frame, &task.background, &params));
        finished.insert(frame);
        compressed.fetch_add(1, Ordering::Relaxed);
    }
    debug!("compressor done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use machine_vision_formats::pixel_format::PixFmt;
    use stamped_frame::Image;

    fn frame_from(width: u32, height: u32, data: Vec<u8>) -> StampedFrame {
        StampedFrame::new(
            Image::mono8(width, height, data).unwrap(),
            1,
            0.5,
            chrono::Utc::now(),
        )
    }

    fn flat_background(width: u32, height: u32, value: u8) -> Arc<BackgroundModel> {
        let median = vec![value; (width * height) as usize];
        Arc::new(BackgroundModel::from_median(0, width, height, median, 10, 0.0).unwrap())
    }

    fn set(data: &mut [u8], width: u32, x: u32, y: u32, value: u8) {
        data[(y * width + x) as usize] = value;
    }

    #[test]
    fn test_empty_frame() {
        let bg = flat_background(8, 8, 100);
        let frame = frame_from(8, 8, vec![105; 64]);
        let c = compress_frame(&frame, &bg, &CompressParams::default()).unwrap();
        assert!(c.boxes.is_empty());
        assert_eq!(c.frame_count, 1);
        assert_eq!(c.timestamp, 0.5);
    }

    #[test]
    fn test_two_components() {
        let bg = flat_background(10, 10, 100);
        let mut data = vec![100; 100];
        // A diagonal pair is 8-connected.
        set(&mut data, 10, 1, 1, 0);
        set(&mut data, 10, 2, 2, 0);
        // A separate bright pixel.
        set(&mut data, 10, 7, 5, 255);
        let c = compress_frame(&frame_from(10, 10, data), &bg, &CompressParams::default()).unwrap();
        assert_eq!(c.boxes.len(), 2);
        let a = &c.boxes[0];
        assert_eq!((a.x0, a.y0, a.width, a.height), (1, 1, 2, 2));
        assert_eq!(a.pixels, vec![0, 100, 100, 0]);
        let b = &c.boxes[1];
        assert_eq!((b.x0, b.y0, b.width, b.height), (7, 5, 1, 1));
        assert_eq!(b.pixels, vec![255]);
    }

    #[test]
    fn test_dilation_merges_nearby_components() {
        let bg = flat_background(10, 10, 100);
        let mut data = vec![100; 100];
        set(&mut data, 10, 2, 4, 0);
        set(&mut data, 10, 5, 4, 0);
        let frame = frame_from(10, 10, data);

        let c = compress_frame(&frame, &bg, &CompressParams::default()).unwrap();
        assert_eq!(c.boxes.len(), 2);

        let params = CompressParams {
            dilate_window: 3,
            ..Default::default()
        };
        let c = compress_frame(&frame, &bg, &params).unwrap();
        assert_eq!(c.boxes.len(), 1);
        let b = &c.boxes[0];
        assert_eq!((b.x0, b.y0, b.width, b.height), (1, 3, 6, 3));
        assert_eq!(b.pixels.len(), 18);
    }

    #[test]
    fn test_box_length_tiles() {
        let bg = flat_background(16, 16, 100);
        let mut data = vec![100; 256];
        for y in 0..5 {
            for x in 0..10 {
                set(&mut data, 16, x, y, 200);
            }
        }
        let params = CompressParams {
            box_length: 4,
            ..Default::default()
        };
        let c = compress_frame(&frame_from(16, 16, data), &bg, &params).unwrap();
        // 10x5 split into columns of 4, 4, 2 and rows of 4, 1.
        assert_eq!(c.boxes.len(), 6);
        for b in &c.boxes {
            assert!(b.width <= 4 && b.height <= 4);
            assert_eq!(b.pixels.len(), b.width as usize * b.height as usize);
            assert!(b.pixels.iter().all(|&p| p == 200));
        }
        let area: usize = c.boxes.iter().map(|b| b.pixels.len()).sum();
        assert_eq!(area, 50);
    }

    #[test]
    fn test_tiles_without_foreground_are_skipped() {
        let bg = flat_background(8, 8, 100);
        let mut data = vec![100; 64];
        // An L shape whose bounding box has an empty corner tile.
        for i in 0..8 {
            set(&mut data, 8, 0, i, 0);
            set(&mut data, 8, i, 7, 0);
        }
        let params = CompressParams {
            box_length: 4,
            ..Default::default()
        };
        let c = compress_frame(&frame_from(8, 8, data), &bg, &params).unwrap();
        assert_eq!(c.boxes.len(), 3);
    }

    #[test]
    fn test_size_mismatch() {
        let bg = flat_background(8, 8, 100);
        let frame = frame_from(4, 4, vec![100; 16]);
        assert!(matches!(
            compress_frame(&frame, &bg, &CompressParams::default()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_stride_padding_is_ignored() {
        let bg = flat_background(3, 2, 100);
        // Padding bytes would be foreground if they were read as pixels.
        let data = vec![100, 100, 0, 255, 255, 100, 100, 100];
        let image = Image::new(3, 2, 5, PixFmt::Mono8, data).unwrap();
        let frame = StampedFrame::new(image, 1, 0.5, chrono::Utc::now());
        let c = compress_frame(&frame, &bg, &CompressParams::default()).unwrap();
        assert_eq!(c.boxes.len(), 1);
        let b = &c.boxes[0];
        assert_eq!((b.x0, b.y0, b.width, b.height), (2, 0, 1, 1));
        assert_eq!(b.pixels, vec![0]);
    }

    #[test]
    fn test_rgb_frame_rejected() {
        let bg = flat_background(2, 2, 100);
        let image = Image::new(2, 2, 6, PixFmt::RGB8, vec![0; 12]).unwrap();
        let frame = StampedFrame::new(image, 1, 0.5, chrono::Utc::now());
        assert!(matches!(
            compress_frame(&frame, &bg, &CompressParams::default()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_finished_frames_wait() {
        let finished = Arc::new(FinishedFrames::default());
        let bg = flat_background(2, 2, 0);
        let inserter = {
            let finished = finished.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                finished.insert(CompressedFrame {
                    frame_count: 3,
                    timestamp: 0.0,
                    boxes: vec![],
                    background: bg,
                });
            })
        };
        assert!(finished.wait_take(2, Duration::from_millis(1)).is_none());
        let got = finished.wait_take(3, Duration::from_secs(2)).unwrap();
        assert_eq!(got.frame_count, 3);
        assert_eq!(finished.len(), 0);
        inserter.join().unwrap();
    }
}
