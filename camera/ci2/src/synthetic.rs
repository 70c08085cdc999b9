//! A camera which renders frames in software.
//!
//! Each frame is a uniform background with a bright square moving across it.
//! Frames are paced at the configured rate. Failures can be injected at
//! chosen frame indices to exercise error handling downstream.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use machine_vision_formats::pixel_format::PixFmt;
use serde::{Deserialize, Serialize};
use stamped_frame::Image;
use tracing::debug;

use crate::{Camera, CameraInfo, Error, Result};

fn default_width() -> u32 {
    320
}

fn default_height() -> u32 {
    240
}

fn default_fps() -> f64 {
    100.0
}

fn default_background() -> u8 {
    20
}

fn default_blob_value() -> u8 {
    230
}

fn default_blob_size() -> u32 {
    16
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyntheticCameraConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    /// Frames per second.
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Intensity of the static background.
    #[serde(default = "default_background")]
    pub background: u8,
    /// Intensity of the moving square.
    #[serde(default = "default_blob_value")]
    pub blob_value: u8,
    /// Side length of the moving square. Zero disables it.
    #[serde(default = "default_blob_size")]
    pub blob_size: u32,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            background: default_background(),
            blob_value: default_blob_value(),
            blob_size: default_blob_size(),
        }
    }
}

/// Failure returned instead of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The frame is lost but acquisition continues.
    CorruptFrame,
    /// The camera stops working.
    DriverFailure,
}

pub struct SyntheticCamera {
    name: String,
    config: SyntheticCameraConfig,
    connected: bool,
    acquiring: bool,
    next_index: u64,
    next_due: Instant,
    faults: BTreeMap<u64, Fault>,
}

impl std::fmt::Debug for SyntheticCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticCamera")
            .field("name", &self.name)
            .field("connected", &self.connected)
            .field("acquiring", &self.acquiring)
            .field("next_index", &self.next_index)
            .finish_non_exhaustive()
    }
}

impl SyntheticCamera {
    pub fn new(config: SyntheticCameraConfig) -> Self {
        Self {
            name: format!("synthetic-{}x{}", config.width, config.height),
            config,
            connected: false,
            acquiring: false,
            next_index: 0,
            next_due: Instant::now(),
            faults: BTreeMap::new(),
        }
    }

    /// Fail the frame with index `frame_index` (counted from 0 over the life
    /// of the camera) with `fault`.
    pub fn inject_fault(&mut self, frame_index: u64, fault: Fault) {
        self.faults.insert(frame_index, fault);
    }

    pub fn with_fault(mut self, frame_index: u64, fault: Fault) -> Self {
        self.inject_fault(frame_index, fault);
        self
    }

    pub fn config(&self) -> &SyntheticCameraConfig {
        &self.config
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.fps)
    }

    fn render(&self, index: u64) -> Result<Image> {
        let w = self.config.width;
        let h = self.config.height;
        let mut data = vec![self.config.background; w as usize * h as usize];
        let size = self.config.blob_size.min(w).min(h);
        if size > 0 {
            let travel = u64::from(w - size) + 1;
            let x0 = (index * 2 % travel) as usize;
            let y0 = ((h - size) / 2) as usize;
            let size = size as usize;
            for row in data.chunks_exact_mut(w as usize).skip(y0).take(size) {
                row[x0..x0 + size].fill(self.config.blob_value);
            }
        }
        Image::mono8(w, h, data).map_err(|e| Error::from(e.to_string()))
    }
}

impl CameraInfo for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }
    fn serial(&self) -> &str {
        "0"
    }
    fn model(&self) -> &str {
        "synthetic"
    }
    fn vendor(&self) -> &str {
        "camrec"
    }
}

impl Camera for SyntheticCamera {
    fn connect(&mut self) -> Result<()> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(Error::from(format!(
                "invalid image size {}x{}",
                self.config.width, self.config.height
            )));
        }
        if !(self.config.fps.is_finite() && self.config.fps > 0.0) {
            return Err(Error::from(format!("invalid frame rate {}", self.config.fps)));
        }
        self.connected = true;
        debug!("connected {}", self.name);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.acquiring = false;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn width(&self) -> Result<u32> {
        Ok(self.config.width)
    }

    fn height(&self) -> Result<u32> {
        Ok(self.config.height)
    }

    fn pixel_format(&self) -> Result<PixFmt> {
        Ok(PixFmt::Mono8)
    }

    fn acquisition_start(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.acquiring = true;
        self.next_due = Instant::now();
        Ok(())
    }

    fn acquisition_stop(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.acquiring = false;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Image> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if !self.acquiring {
            return Err("acquisition not started".into());
        }

        let now = Instant::now();
        if self.next_due > now + timeout {
            std::thread::sleep(timeout);
            return Err(Error::Timeout);
        }
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }

        let index = self.next_index;
        self.next_index += 1;
        self.next_due += self.period();

        match self.faults.remove(&index) {
            Some(Fault::CorruptFrame) => Err(Error::SingleFrameError(format!(
                "frame {index} corrupt"
            ))),
            Some(Fault::DriverFailure) => {
                self.acquiring = false;
                Err(format!("driver failure at frame {index}").into())
            }
            None => self.render(index),
        }
    }
}
