use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_channel::{Receiver, Sender};
use machine_vision_formats::pixel_format::PixFmt;
use pipeline_sync::{PoolError, SynchronizedQueue, WorkerPool};
use stamped_frame::StampedFrame;
use tracing::{debug, error, info};

use crate::{
    Error, Result, UfmfConfig, VideoWriter,
    background::{self, BackgroundModel, BackgroundQueues, HistogramParams},
    compressor::{self, CompressParams, CompressTask, FinishedFrames},
    sink::{self, FrameSink, SerializerCounters, UfmfFileSink},
};

/// Frame counts at the stages of a [UfmfVideoWriter].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Frames passed to `add_frame`.
    pub frames_added: u64,
    /// Frames kept after frame skipping.
    pub frames_offered: u64,
    /// Kept frames which were also queued for the background model.
    pub frames_sampled: u64,
    /// Frames the histogram worker has binned.
    pub frames_binned: u64,
    /// Frames queued for compression.
    pub frames_submitted: u64,
    pub frames_compressed: u64,
    pub frames_written: u64,
    /// Models published by the median worker.
    pub background_updates: u64,
    pub keyframes_written: u64,
}

#[derive(Default)]
struct Counters {
    frames_binned: Arc<AtomicU64>,
    frames_compressed: Arc<AtomicU64>,
    frames_written: Arc<AtomicU64>,
    background_updates: Arc<AtomicU64>,
    keyframes_written: Arc<AtomicU64>,
}

/// Worker threads and queues, created on the first frame.
struct Running {
    width: u32,
    height: u32,
    background: Arc<BackgroundModel>,
    bg_queues: Arc<BackgroundQueues>,
    todo: Arc<SynchronizedQueue<CompressTask>>,
    order: Arc<SynchronizedQueue<u64>>,
    finished: Arc<FinishedFrames>,
    bg_pool: WorkerPool,
    compress_pool: WorkerPool,
    serialize_pool: WorkerPool,
}

impl Running {
    fn new(background: Arc<BackgroundModel>, compressor_thread_count: usize) -> Self {
        Self {
            width: background.width(),
            height: background.height(),
            background,
            bg_queues: Arc::new(BackgroundQueues::default()),
            todo: Arc::new(SynchronizedQueue::new()),
            order: Arc::new(SynchronizedQueue::new()),
            finished: Arc::new(FinishedFrames::default()),
            bg_pool: WorkerPool::new("ufmf-bg", 2),
            compress_pool: WorkerPool::new("ufmf-compressor", compressor_thread_count),
            serialize_pool: WorkerPool::new("ufmf", 1),
        }
    }

    /// Stop the workers in pipeline order and wait for them. Compressors
    /// drain their queue and the serializer writes everything compressed
    /// before closing the sink.
    fn shutdown(&mut self) -> std::result::Result<(), PoolError> {
        self.bg_pool.stop_all();
        self.bg_queues.signal_all();

        self.compress_pool.stop_all();
        self.todo.signal_not_empty();
        let r1 = self.compress_pool.join_all();

        self.serialize_pool.stop_all();
        self.order.signal_not_empty();
        let r2 = self.serialize_pool.join_all();

        let r3 = self.bg_pool.join_all();

        self.bg_queues.clear();
        self.todo.clear();
        self.order.clear();
        self.finished.clear();
        r1.and(r2).and(r3)
    }
}

/// Background subtraction encoder writing `.ufmf` files.
///
/// The first frame seeds the background model and starts the workers. Each
/// kept frame is offered to the background model (only if the previous
/// sample has been taken) and queued for compression against the newest
/// model picked up so far. Compressed frames are written in order by a
/// single serializer thread.
pub struct UfmfVideoWriter {
    cfg: UfmfConfig,
    file_name: Option<PathBuf>,
    frame_skip: u32,
    threshold: u8,
    sink: Option<Box<dyn FrameSink>>,
    running: Option<Running>,
    err_tx: Sender<Error>,
    err_rx: Receiver<Error>,
    counters: Counters,
    /// Counts every frame added. Frame skipping is based on this.
    frame_counter: u64,
    last_frame_count: Option<u64>,
    frames_offered: u64,
    frames_sampled: u64,
    frames_submitted: u64,
    is_finished: bool,
}

impl std::fmt::Debug for UfmfVideoWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UfmfVideoWriter")
            .field("file_name", &self.file_name)
            .field("frame_skip", &self.frame_skip)
            .field("frame_counter", &self.frame_counter)
            .field("is_finished", &self.is_finished)
            .finish_non_exhaustive()
    }
}

impl UfmfVideoWriter {
    pub fn new(cfg: UfmfConfig) -> Result<Self> {
        cfg.validate()?;
        let threshold = cast::u8(cfg.background_threshold)?;
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            file_name: cfg.output_path.clone(),
            frame_skip: cfg.frame_skip,
            threshold,
            cfg,
            sink: None,
            running: None,
            err_tx,
            err_rx,
            counters: Counters::default(),
            frame_counter: 0,
            last_frame_count: None,
            frames_offered: 0,
            frames_sampled: 0,
            frames_submitted: 0,
            is_finished: false,
        })
    }

    /// Use `sink` for output instead of a `.ufmf` file.
    pub fn with_sink(cfg: UfmfConfig, sink: Box<dyn FrameSink>) -> Result<Self> {
        let mut result = Self::new(cfg)?;
        result.sink = Some(sink);
        Ok(result)
    }

    pub fn stats(&self) -> WriterStats {
        let c = &self.counters;
        WriterStats {
            frames_added: self.frame_counter,
            frames_offered: self.frames_offered,
            frames_sampled: self.frames_sampled,
            frames_binned: c.frames_binned.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted,
            frames_compressed: c.frames_compressed.load(Ordering::Relaxed),
            frames_written: c.frames_written.load(Ordering::Relaxed),
            background_updates: c.background_updates.load(Ordering::Relaxed),
            keyframes_written: c.keyframes_written.load(Ordering::Relaxed),
        }
    }

    /// Validate the first frame, seed the background model from it and
    /// start the workers.
    fn start(&mut self, frame: &StampedFrame) -> Result<Running> {
        let image = frame.image.as_mono8().ok_or_else(|| {
            Error::Format(format!(
                "pixel format {} not supported, only {}",
                frame.pixel_format(),
                PixFmt::Mono8
            ))
        })?;
        let width = frame.width();
        let height = frame.height();
        if width == 0 || height == 0 {
            return Err(Error::Format(format!("empty frame {width}x{height}")));
        }

        let sink: Box<dyn FrameSink> = match self.sink.take() {
            Some(sink) => sink,
            None => {
                let path = self.file_name.as_ref().ok_or(Error::NoFileName)?;
                Box::new(UfmfFileSink::create(path, width, height)?)
            }
        };

        let background = Arc::new(BackgroundModel::from_image(
            image,
            self.threshold,
            frame.timestamp,
        )?);
        let run = self.launch(
            Running::new(background, self.cfg.compressor_thread_count),
            sink,
        )?;

        info!(
            "ufmf writer started: {}x{}, {} compressors, frame skip {}",
            width, height, self.cfg.compressor_thread_count, self.frame_skip
        );
        Ok(run)
    }

    /// Start the workers of `run`. If a spawn fails, the workers already
    /// started are stopped before the error is returned.
    fn launch(&self, mut run: Running, sink: Box<dyn FrameSink>) -> Result<Running> {
        if let Err(e) = self.spawn_workers(&mut run, sink) {
            if let Err(join_err) = run.shutdown() {
                error!("stopping workers after failed start: {join_err}");
            }
            return Err(e);
        }
        Ok(run)
    }

    fn spawn_workers(&self, run: &mut Running, sink: Box<dyn FrameSink>) -> Result<()> {
        {
            let counters = SerializerCounters {
                frames_written: self.counters.frames_written.clone(),
                keyframes_written: self.counters.keyframes_written.clone(),
            };
            let order = run.order.clone();
            let finished = run.finished.clone();
            let err_tx = self.err_tx.clone();
            run.serialize_pool.spawn("serializer", move |flag| {
                sink::serializer_worker(sink, order, finished, counters, flag, err_tx)
            })?;
        }

        let params = CompressParams {
            box_length: self.cfg.box_length,
            dilate_window: self.cfg.dilate_window,
        };
        for i in 0..self.cfg.compressor_thread_count {
            let todo = run.todo.clone();
            let finished = run.finished.clone();
            let compressed = self.counters.frames_compressed.clone();
            let err_tx = self.err_tx.clone();
            run.compress_pool.spawn(&i.to_string(), move |flag| {
                compressor::compressor_worker(todo, finished, params, compressed, flag, err_tx)
            })?;
        }

        {
            let params = HistogramParams {
                width: run.width,
                height: run.height,
                num_bins: self.cfg.num_bins,
                bin_size: self.cfg.bin_size,
                median_update_count: self.cfg.median_update_count,
                median_update_interval: self.cfg.median_update_interval,
            };
            let queues = run.bg_queues.clone();
            let samples = self.counters.frames_binned.clone();
            let err_tx = self.err_tx.clone();
            run.bg_pool.spawn("histogram", move |flag| {
                background::histogram_worker(queues, params, samples, flag, err_tx)
            })?;
        }
        {
            let queues = run.bg_queues.clone();
            let seed = run.background.clone();
            let threshold = self.threshold;
            let updates = self.counters.background_updates.clone();
            let err_tx = self.err_tx.clone();
            run.bg_pool.spawn("median", move |flag| {
                background::median_worker(queues, seed, threshold, updates, flag, err_tx)
            })?;
        }
        Ok(())
    }
}

impl VideoWriter for UfmfVideoWriter {
    fn set_file_name(&mut self, path: PathBuf) {
        self.file_name = Some(path);
    }

    fn set_frame_skip(&mut self, frame_skip: u32) {
        self.frame_skip = frame_skip.max(1);
    }

    fn add_frame(&mut self, frame: StampedFrame) -> Result<()> {
        async_err!(self.err_rx);
        if self.is_finished {
            return Err(Error::AlreadyFinished);
        }

        if self.running.is_none() {
            let run = self.start(&frame)?;
            self.running = Some(run);
        }
        let Some(run) = self.running.as_mut() else {
            return Err(Error::Encode("workers not running".into()));
        };

        if frame.width() != run.width
            || frame.height() != run.height
            || frame.pixel_format() != PixFmt::Mono8
        {
            return Err(Error::Format(format!(
                "frame {} is {}x{} {}, expected {}x{} {}",
                frame.frame_count,
                frame.width(),
                frame.height(),
                frame.pixel_format(),
                run.width,
                run.height,
                PixFmt::Mono8
            )));
        }
        if let Some(previous) = self.last_frame_count {
            if frame.frame_count <= previous {
                return Err(Error::OutOfOrder {
                    previous,
                    current: frame.frame_count,
                });
            }
        }
        self.last_frame_count = Some(frame.frame_count);

        let n = self.frame_counter;
        self.frame_counter += 1;
        if n % u64::from(self.frame_skip) != 0 {
            return Ok(());
        }
        self.frames_offered += 1;

        let depth = run.todo.len();
        if depth > self.cfg.max_compressor_backlog {
            return Err(Error::QueueOverflow {
                queue: "compressor",
                depth,
                max: self.cfg.max_compressor_backlog,
            });
        }
        let depth = run.finished.len();
        if depth > self.cfg.max_finished_backlog {
            return Err(Error::QueueOverflow {
                queue: "finished frame",
                depth,
                max: self.cfg.max_finished_backlog,
            });
        }

        {
            let mut images = run.bg_queues.images.acquire();
            if images.is_empty() {
                images.push(frame.clone());
                self.frames_sampled += 1;
            }
        }

        if let Some(model) = run.bg_queues.models.try_pop() {
            debug!("using background model {}", model.generation());
            run.background = model;
        }

        run.order.push(frame.frame_count);
        run.todo.push(CompressTask {
            frame,
            background: run.background.clone(),
        });
        self.frames_submitted += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.is_finished {
            return Ok(());
        }
        self.is_finished = true;

        let mut result = Ok(());
        if let Some(mut run) = self.running.take() {
            result = run.shutdown().map_err(Error::from);
            info!("ufmf writer finished: {:?}", self.stats());
        } else if let Some(mut sink) = self.sink.take() {
            result = sink.close();
        }

        async_err!(self.err_rx);
        result
    }
}

impl Drop for UfmfVideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!("error finishing ufmf writer: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::CompressedFrame;
    use machine_vision_formats::{owned::OImage, pixel_format::Mono8};
    use std::sync::atomic::AtomicBool;
    use test_log::test;

    struct CloseRecorder(Arc<AtomicBool>);

    impl FrameSink for CloseRecorder {
        fn write_background(&mut self, _model: &BackgroundModel) -> Result<()> {
            Ok(())
        }
        fn write_frame(&mut self, _frame: &CompressedFrame) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failed_launch_stops_started_workers() {
        let cfg = UfmfConfig {
            compressor_thread_count: 2,
            ..Default::default()
        };
        let writer = UfmfVideoWriter::new(cfg).unwrap();
        let image = OImage::<Mono8>::new(4, 4, 4, vec![0; 16]).unwrap();
        let background = Arc::new(BackgroundModel::from_image(&image, 10, 0.0).unwrap());
        let closed = Arc::new(AtomicBool::new(false));

        // The serializer starts, then the compressor pool has no room.
        let run = Running::new(background, 0);
        let result = writer.launch(run, Box::new(CloseRecorder(closed.clone())));

        assert!(matches!(
            result,
            Err(Error::Pool(PoolError::Full { max_threads: 0, .. }))
        ));
        // The serializer was stopped and joined, which closes its sink.
        assert!(closed.load(Ordering::SeqCst));
    }
}
