use std::{sync::Arc, time::Duration};

use pipeline_sync::SynchronizedValue;
use stamped_frame::Image;

pub mod synthetic;

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A single frame was lost or corrupt. Acquisition can continue.
    #[error("SingleFrameError({0})")]
    SingleFrameError(String),
    /// No frame arrived within the requested timeout.
    #[error("Timeout")]
    Timeout,
    #[error("camera not connected")]
    NotConnected,
    #[error("CI2Error({msg})")]
    CI2Error { msg: String },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::CI2Error {
            msg: orig.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::CI2Error { msg }
    }
}

// ---------------------------
// CameraInfo

pub trait CameraInfo {
    fn name(&self) -> &str;
    fn serial(&self) -> &str;
    fn model(&self) -> &str;
    fn vendor(&self) -> &str;
}

// ---------------------------
// Camera

/// A camera which delivers frames synchronously.
///
/// Implementations need not be thread safe. Callers sharing a camera between
/// threads wrap it in a [SharedCamera] and hold the lock for the duration of
/// each call.
pub trait Camera: CameraInfo + Send {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// Return the sensor width in pixels
    fn width(&self) -> Result<u32>;
    /// Return the sensor height in pixels
    fn height(&self) -> Result<u32>;
    fn pixel_format(&self) -> Result<machine_vision_formats::pixel_format::PixFmt>;

    // Acquisition ----------------------------
    fn acquisition_start(&mut self) -> Result<()>;
    fn acquisition_stop(&mut self) -> Result<()>;

    /// Synchronous (blocking) frame acquisition.
    ///
    /// Returns [Error::Timeout] if no frame is available within `timeout`.
    /// Returns [Error::SingleFrameError] if one frame was lost and later
    /// frames may still arrive. Any other error means acquisition cannot
    /// continue.
    fn next_frame(&mut self, timeout: Duration) -> Result<Image>;
}

/// A camera used from several threads, one call at a time.
pub type SharedCamera<C> = Arc<SynchronizedValue<C>>;

pub fn shared<C: Camera>(camera: C) -> SharedCamera<C> {
    Arc::new(SynchronizedValue::new(camera))
}
