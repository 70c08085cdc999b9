use std::{sync::Arc, time::Duration};

use pipeline_sync::{SynchronizedQueue, SynchronizedValue};
use stamped_frame::StampedFrame;
use tracing::debug;

use crate::stats::{FpsCalc, FrameStats};

/// The newest frame and statistics, read by the preview.
#[derive(Debug, Clone, Default)]
pub(crate) struct PreviewState {
    pub(crate) frame: Option<StampedFrame>,
    pub(crate) stats: FrameStats,
}

pub(crate) struct FrameDispatcher {
    pub(crate) input: Arc<SynchronizedQueue<StampedFrame>>,
    /// `None` if this session does not record.
    pub(crate) log_queue: Option<Arc<SynchronizedQueue<StampedFrame>>>,
    pub(crate) preview: Arc<SynchronizedValue<PreviewState>>,
    pub(crate) fps_averaging_frames: u64,
    pub(crate) poll: Duration,
}

impl FrameDispatcher {
    pub(crate) fn run(self, flag: thread_control::Flag) {
        let mut fps_calc = FpsCalc::new(self.fps_averaging_frames);
        let mut n_frames = 0u64;
        loop {
            let Some(frame) = self.input.pop_timeout(self.poll) else {
                if !flag.is_alive() {
                    break;
                }
                continue;
            };
            let fps = fps_calc.update(frame.frame_count, frame.timestamp);
            {
                let mut preview = self.preview.lock();
                preview.stats.frame_count = frame.frame_count;
                preview.stats.timestamp = frame.timestamp;
                if let Some(fps) = fps {
                    preview.stats.fps = fps;
                }
                preview.frame = Some(frame.clone());
            }
            if let Some(log_queue) = &self.log_queue {
                log_queue.push(frame);
            }
            n_frames += 1;
        }
        debug!("dispatcher done after {n_frames} frames");
    }
}
