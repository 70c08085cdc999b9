//! Camera capture sessions.
//!
//! A [Session] runs three stages on their own threads:
//!
//! - the frame grabber pulls frames from the camera and stamps them,
//! - the frame dispatcher keeps the preview frame and statistics current and
//!   forwards frames for recording,
//! - the frame logger feeds frames to a [video_writer::VideoWriter].
//!
//! Stages hand frames over through [pipeline_sync::SynchronizedQueue]s and
//! report failures on an error channel. Any fatal error stops the session,
//! flushing what has been recorded so far.

mod config;
mod dispatcher;
mod error;
mod grabber;
mod logger;
mod session;
mod stats;

pub use config::{LoggingConfig, SessionConfig, unique_path};
pub use error::{Error, ErrorKind, Result};
pub use grabber::GrabberState;
pub use session::Session;
pub use stats::{FpsCalc, FrameStats};
