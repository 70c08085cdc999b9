use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_channel::Sender;
use machine_vision_formats::pixel_format::PixFmt;
use pipeline_sync::SynchronizedQueue;
use tracing::{debug, error, info, warn};
use ufmf::{BoxRef, RectFromCorner, UFMFWriter};

use crate::{
    Error, Result, WORKER_POLL_INTERVAL,
    background::BackgroundModel,
    compressor::{CompressedFrame, FinishedFrames},
};

/// Destination for the encoder output, called from the serializer thread in
/// frame order.
pub trait FrameSink: Send {
    /// Store a background model. Called before the first frame compressed
    /// against it.
    fn write_background(&mut self, model: &BackgroundModel) -> Result<()>;
    fn write_frame(&mut self, frame: &CompressedFrame) -> Result<()>;
    /// Flush and close. No further calls follow.
    fn close(&mut self) -> Result<()>;
}

/// Writes a `.ufmf` file. Backgrounds become `mean` keyframes.
pub struct UfmfFileSink {
    path: PathBuf,
    writer: UFMFWriter<BufWriter<File>>,
}

impl std::fmt::Debug for UfmfFileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UfmfFileSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl UfmfFileSink {
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self> {
        let max_width = u16::try_from(width)
            .map_err(|_| Error::Format(format!("width {width} too large for ufmf")))?;
        let max_height = u16::try_from(height)
            .map_err(|_| Error::Format(format!("height {height} too large for ufmf")))?;
        let f = BufWriter::new(File::create(path)?);
        let writer = UFMFWriter::new(f, max_width, max_height, PixFmt::Mono8)?;
        info!("saving ufmf movie to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }
}

impl FrameSink for UfmfFileSink {
    fn write_background(&mut self, model: &BackgroundModel) -> Result<()> {
        self.writer
            .add_keyframe(b"mean", model.timestamp(), model.median_image())?;
        Ok(())
    }

    fn write_frame(&mut self, frame: &CompressedFrame) -> Result<()> {
        let boxes: Vec<BoxRef> = frame
            .boxes
            .iter()
            .map(|b| BoxRef {
                rect: RectFromCorner::new(b.x0, b.y0, b.width, b.height),
                pixels: &b.pixels,
            })
            .collect();
        self.writer.add_frame(frame.timestamp, &boxes)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut f = self.writer.close()?;
        f.flush()?;
        debug!("closed {}", self.path.display());
        Ok(())
    }
}

pub(crate) struct SerializerCounters {
    pub(crate) frames_written: Arc<AtomicU64>,
    pub(crate) keyframes_written: Arc<AtomicU64>,
}

fn write_frame_with_background(
    sink: &mut dyn FrameSink,
    frame: &CompressedFrame,
    last_generation: &mut Option<u64>,
    counters: &SerializerCounters,
) -> Result<()> {
    let generation = frame.background.generation();
    if *last_generation != Some(generation) {
        sink.write_background(&frame.background)?;
        counters.keyframes_written.fetch_add(1, Ordering::Relaxed);
        *last_generation = Some(generation);
    }
    sink.write_frame(frame)
}

/// Write finished frames in the order their numbers appear on `order`.
pub(crate) fn serializer_worker(
    mut sink: Box<dyn FrameSink>,
    order: Arc<SynchronizedQueue<u64>>,
    finished: Arc<FinishedFrames>,
    counters: SerializerCounters,
    flag: thread_control::Flag,
    err_tx: Sender<Error>,
) {
    let mut last_generation = None;
    let mut failed = false;
    loop {
        let Some(frame_count) = order.pop_timeout(WORKER_POLL_INTERVAL) else {
            if !flag.is_alive() {
                break;
            }
            continue;
        };
        let frame = loop {
            if let Some(frame) = finished.wait_take(frame_count, WORKER_POLL_INTERVAL) {
                break Some(frame);
            }
            if !flag.is_alive() {
                // All compressors have exited by now.
                break finished.take(frame_count);
            }
        };
        let Some(frame) = frame else {
            warn!("frame {frame_count} was never compressed, skipping");
            continue;
        };
        if failed {
            continue;
        }
        let result = write_frame_with_background(
            sink.as_mut(),
            &frame,
            &mut last_generation,
            &counters,
        );
        match result {
            Ok(()) => {
                counters.frames_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!("writing frame {frame_count} failed: {e}");
                let _ = err_tx.send(e);
                failed = true;
            }
        }
    }
    if let Err(e) = sink.close() {
        error!("closing output failed: {e}");
        let _ = err_tx.send(e);
    }
    debug!("serializer done");
}
