/// Acquisition statistics shown alongside the preview.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    /// Frames per second averaged over recent frames. Zero until enough
    /// frames have arrived.
    pub fps: f64,
    /// Frame count of the newest frame.
    pub frame_count: u64,
    /// Timestamp of the newest frame, in seconds since capture started.
    pub timestamp: f64,
    /// Frames lost by the camera driver.
    pub frames_dropped: u64,
}

/// Frame rate from frame counts and timestamps.
///
/// Frame counts may skip values. The rate is the number of counts elapsed
/// divided by the time elapsed, so skipped frames do not bias it.
#[derive(Debug, Clone)]
pub struct FpsCalc {
    prev: Option<(u64, f64)>,
    frames_to_average: u64,
}

impl FpsCalc {
    /// create a new FpsCalc instance
    pub fn new(frames_to_average: u64) -> Self {
        Self {
            prev: None,
            frames_to_average,
        }
    }

    /// return a newly computed fps value whenever available.
    pub fn update(&mut self, frame_count: u64, timestamp: f64) -> Option<f64> {
        let mut reset_previous = true;
        let mut result = None;
        if let Some((prev_frame, prev_stamp)) = self.prev {
            let n_frames = frame_count.saturating_sub(prev_frame);
            if n_frames < self.frames_to_average {
                reset_previous = false;
            } else {
                let dt = timestamp - prev_stamp;
                if dt > 0.0 {
                    result = Some(n_frames as f64 / dt);
                }
            }
        }
        if reset_previous {
            self.prev = Some((frame_count, timestamp));
        }
        result
    }
}
