use std::{sync::Arc, time::Duration};

use crossbeam_channel::Sender;
use pipeline_sync::SynchronizedQueue;
use stamped_frame::StampedFrame;
use tracing::{debug, error};
use video_writer::VideoWriter;

use crate::Error;

/// Feeds queued frames to a [VideoWriter].
pub(crate) struct FrameLogger {
    pub(crate) input: Arc<SynchronizedQueue<StampedFrame>>,
    pub(crate) writer: Box<dyn VideoWriter>,
    pub(crate) max_queue_size: usize,
    pub(crate) poll: Duration,
    pub(crate) err_tx: Sender<Error>,
}

impl FrameLogger {
    pub(crate) fn run(mut self, flag: thread_control::Flag) {
        let mut n_frames = 0u64;
        loop {
            let depth = self.input.len();
            if depth > self.max_queue_size {
                error!("image logger max queue size exceeded: {depth} frames");
                let _ = self.err_tx.send(Error::LogQueueOverflow {
                    depth,
                    max: self.max_queue_size,
                });
                break;
            }
            let Some(frame) = self.input.pop_timeout(self.poll) else {
                if !flag.is_alive() {
                    break;
                }
                continue;
            };
            if let Err(e) = self.writer.add_frame(frame) {
                error!("video writer failed: {e}");
                let _ = self.err_tx.send(Error::VideoWriter(e));
                break;
            }
            n_frames += 1;
        }
        // Whatever was encoded so far is flushed.
        if let Err(e) = self.writer.finish() {
            error!("finishing video failed: {e}");
            let _ = self.err_tx.send(Error::VideoWriter(e));
        }
        debug!("logger done after {n_frames} frames");
    }
}
