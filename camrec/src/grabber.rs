use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ci2::{Camera, SharedCamera};
use crossbeam_channel::Sender;
use pipeline_sync::{SynchronizedQueue, SynchronizedValue};
use stamped_frame::StampedFrame;
use tracing::{debug, error, info, warn};

use crate::Error;

/// Lifecycle of the frame grabber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabberState {
    Idle,
    Connected,
    Capturing,
    Stopping,
    Stopped,
}

/// Pulls frames from the camera, stamps them and queues them for the
/// dispatcher.
pub(crate) struct FrameGrabber<C: Camera> {
    pub(crate) camera: SharedCamera<C>,
    pub(crate) output: Arc<SynchronizedQueue<StampedFrame>>,
    pub(crate) state: Arc<SynchronizedValue<GrabberState>>,
    pub(crate) dropped: Arc<AtomicU64>,
    pub(crate) grab_timeout: Duration,
    pub(crate) err_tx: Sender<Error>,
}

impl<C: Camera> FrameGrabber<C> {
    pub(crate) fn run(self, flag: thread_control::Flag) {
        if !self.camera.lock().is_connected() {
            self.state.set(GrabberState::Stopped);
            let _ = self.err_tx.send(Error::Capture(ci2::Error::NotConnected));
            return;
        }
        self.state.set(GrabberState::Connected);

        let started = self.camera.lock().acquisition_start();
        if let Err(e) = started {
            error!("could not start acquisition: {e}");
            self.state.set(GrabberState::Stopped);
            let _ = self.err_tx.send(Error::StartCapture(e));
            return;
        }
        self.state.set(GrabberState::Capturing);
        info!("capture started");

        let start = Instant::now();
        let mut frame_count = 0;
        while flag.alive() {
            // The lock is released before the frame is queued.
            let result = self.camera.lock().next_frame(self.grab_timeout);
            match result {
                Ok(image) => {
                    let frame = StampedFrame::new(
                        image,
                        frame_count,
                        start.elapsed().as_secs_f64(),
                        chrono::Utc::now(),
                    );
                    frame_count += 1;
                    self.output.push(frame);
                }
                Err(ci2::Error::Timeout) => {}
                Err(ci2::Error::SingleFrameError(msg)) => {
                    warn!("dropped frame: {msg}");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("capture failed: {e}");
                    let _ = self.err_tx.send(Error::Capture(e));
                    break;
                }
            }
        }

        self.state.set(GrabberState::Stopping);
        let stopped = self.camera.lock().acquisition_stop();
        if let Err(e) = stopped {
            warn!("could not stop acquisition: {e}");
            let _ = self.err_tx.send(Error::StopCapture(e));
        }
        self.state.set(GrabberState::Stopped);
        debug!("grabber done after {frame_count} frames");
    }
}
