use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use ci2::{Camera, SharedCamera};
use crossbeam_channel::Receiver;
use pipeline_sync::{MAX_THREAD_COUNT, PoolError, SynchronizedQueue, SynchronizedValue, WorkerPool};
use stamped_frame::StampedFrame;
use tracing::{debug, error, info, warn};
use video_writer::VideoWriter;

use crate::{
    Error, Result, SessionConfig,
    dispatcher::{FrameDispatcher, PreviewState},
    grabber::{FrameGrabber, GrabberState},
    logger::FrameLogger,
    stats::FrameStats,
};

const GRABBER: &str = "grabber";
const DISPATCHER: &str = "dispatcher";
const LOGGER: &str = "logger";

/// State shared by the session handle and its monitor thread.
struct SessionInner {
    grab_queue: Arc<SynchronizedQueue<StampedFrame>>,
    log_queue: Arc<SynchronizedQueue<StampedFrame>>,
    grabber_state: Arc<SynchronizedValue<GrabberState>>,
    preview: Arc<SynchronizedValue<PreviewState>>,
    dropped: Arc<AtomicU64>,
    /// `None` once shut down.
    pool: SynchronizedValue<Option<WorkerPool>>,
    is_logging: bool,
    grab_timeout: Duration,
}

impl SessionInner {
    /// Stop and join the stages in pipeline order, then discard anything
    /// still queued. Concurrent callers wait until the first one is done.
    fn shutdown(&self) -> Result<()> {
        let mut pool_guard = self.pool.lock();
        let Some(mut pool) = pool_guard.take() else {
            return Ok(());
        };
        debug!("shutting down session");

        let r1 = self.stop_grabber(&mut pool);

        let r2 = pool.stop_worker(DISPATCHER).and_then(|()| {
            self.grab_queue.signal_not_empty();
            pool.join_worker(DISPATCHER)
        });

        let r3 = if self.is_logging {
            pool.stop_worker(LOGGER).and_then(|()| {
                self.log_queue.signal_not_empty();
                pool.join_worker(LOGGER)
            })
        } else {
            Ok(())
        };

        let r4 = pool.join_all();

        self.grab_queue.clear();
        self.log_queue.clear();
        info!("session stopped");
        r1.and(r2).and(r3).and(r4)?;
        Ok(())
    }

    /// The grabber checks for a stop request between frames, so it returns
    /// within one grab timeout unless the driver call hangs.
    fn stop_grabber(&self, pool: &mut WorkerPool) -> std::result::Result<(), PoolError> {
        pool.stop_worker(GRABBER)?;
        let deadline = self.grab_timeout * 2;
        if !pool.wait_for_done(GRABBER, deadline)? {
            warn!("grabber still blocked in the camera driver after {deadline:?}");
        }
        pool.join_worker(GRABBER)
    }
}

/// A running capture session.
///
/// Frames flow from the camera through the grabber, dispatcher and (when
/// recording) logger threads. Errors from any stage are delivered on
/// [Session::errors]; fatal ones also stop the session.
pub struct Session {
    inner: Arc<SessionInner>,
    monitor: Option<JoinHandle<()>>,
    errors: Receiver<Error>,
    output_path: Option<PathBuf>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("output_path", &self.output_path)
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start capturing from `camera`. If `config.logging` is set, frames are
    /// recorded to a new file in the configured format.
    pub fn start<C>(camera: SharedCamera<C>, config: SessionConfig) -> Result<Self>
    where
        C: Camera + 'static,
    {
        config.validate()?;
        match &config.logging {
            Some(logging) => {
                let path = logging.output_path(&chrono::Local::now())?;
                let mut writer = logging.format.new_writer()?;
                writer.set_file_name(path.clone());
                Self::launch(camera, config, Some(writer), Some(path))
            }
            None => Self::launch(camera, config, None, None),
        }
    }

    /// Start capturing from `camera` and record with `writer`, ignoring
    /// `config.logging`.
    pub fn start_with_writer<C>(
        camera: SharedCamera<C>,
        config: SessionConfig,
        writer: Box<dyn VideoWriter>,
    ) -> Result<Self>
    where
        C: Camera + 'static,
    {
        config.validate()?;
        Self::launch(camera, config, Some(writer), None)
    }

    fn launch<C>(
        camera: SharedCamera<C>,
        config: SessionConfig,
        writer: Option<Box<dyn VideoWriter>>,
        output_path: Option<PathBuf>,
    ) -> Result<Self>
    where
        C: Camera + 'static,
    {
        if !camera.lock().is_connected() {
            return Err(Error::Capture(ci2::Error::NotConnected));
        }

        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        let (app_tx, app_rx) = crossbeam_channel::unbounded();

        let inner = Arc::new(SessionInner {
            grab_queue: Arc::new(SynchronizedQueue::new()),
            log_queue: Arc::new(SynchronizedQueue::new()),
            grabber_state: Arc::new(SynchronizedValue::new(GrabberState::Idle)),
            preview: Arc::new(SynchronizedValue::new(PreviewState::default())),
            dropped: Arc::new(AtomicU64::new(0)),
            pool: SynchronizedValue::new(None),
            is_logging: writer.is_some(),
            grab_timeout: config.grab_timeout(),
        });

        let mut pool = WorkerPool::new("camrec", MAX_THREAD_COUNT);
        let spawned = (|| -> Result<()> {
            // Consumers first, so no stage produces into a queue nobody reads.
            if let Some(writer) = writer {
                let logger = FrameLogger {
                    input: inner.log_queue.clone(),
                    writer,
                    max_queue_size: config.max_log_queue_size,
                    poll: config.queue_poll(),
                    err_tx: err_tx.clone(),
                };
                pool.spawn(LOGGER, move |flag| logger.run(flag))?;
            }
            let dispatcher = FrameDispatcher {
                input: inner.grab_queue.clone(),
                log_queue: inner.is_logging.then(|| inner.log_queue.clone()),
                preview: inner.preview.clone(),
                fps_averaging_frames: config.fps_averaging_frames,
                poll: config.queue_poll(),
            };
            pool.spawn(DISPATCHER, move |flag| dispatcher.run(flag))?;
            let grabber = FrameGrabber {
                camera,
                output: inner.grab_queue.clone(),
                state: inner.grabber_state.clone(),
                dropped: inner.dropped.clone(),
                grab_timeout: config.grab_timeout(),
                err_tx: err_tx.clone(),
            };
            pool.spawn(GRABBER, move |flag| grabber.run(flag))?;
            Ok(())
        })();
        inner.pool.set(Some(pool));
        // Only the workers hold senders, so the monitor ends when they do.
        drop(err_tx);
        if let Err(e) = spawned {
            if let Err(e2) = inner.shutdown() {
                error!("cleanup after failed start: {e2}");
            }
            return Err(e);
        }

        let spawned = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("camrec-monitor".to_string())
                .spawn(move || monitor(inner, err_rx, app_tx))
        };
        let monitor = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(e2) = inner.shutdown() {
                    error!("cleanup after failed start: {e2}");
                }
                return Err(e.into());
            }
        };

        if let Some(path) = &output_path {
            info!("recording to {}", path.display());
        }
        Ok(Self {
            inner,
            monitor: Some(monitor),
            errors: app_rx,
            output_path,
        })
    }

    /// Stop all stages, flush the recording and wait for completion.
    pub fn stop(&mut self) -> Result<()> {
        let result = self.inner.shutdown();
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                error!("session monitor panicked");
            }
        }
        result
    }

    /// False once the session has stopped, whether by [Session::stop] or
    /// after a fatal error.
    pub fn is_running(&self) -> bool {
        self.inner.pool.lock().is_some()
    }

    /// The newest frame seen by the dispatcher.
    pub fn latest_preview_frame(&self) -> Option<StampedFrame> {
        self.inner.preview.lock().frame.clone()
    }

    pub fn stats(&self) -> FrameStats {
        let mut stats = self.inner.preview.lock().stats;
        stats.frames_dropped = self.inner.dropped.load(Ordering::Relaxed);
        stats
    }

    /// Errors reported by the pipeline, in the order they occurred.
    pub fn errors(&self) -> Receiver<Error> {
        self.errors.clone()
    }

    pub fn grabber_state(&self) -> GrabberState {
        self.inner.grabber_state.get()
    }

    /// The movie file, if recording with the configured format.
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("error stopping session: {e}");
        }
    }
}

fn monitor(inner: Arc<SessionInner>, err_rx: Receiver<Error>, app_tx: crossbeam_channel::Sender<Error>) {
    for err in err_rx.iter() {
        let fatal = err.is_fatal();
        error!("session error ({:?}): {err}", err.kind());
        let _ = app_tx.send(err);
        if fatal {
            if let Err(e) = inner.shutdown() {
                error!("shutdown after error failed: {e}");
                let _ = app_tx.send(e);
            }
        }
    }
    debug!("monitor done");
}
