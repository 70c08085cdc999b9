//! Save camera frames to disk.
//!
//! The [VideoWriter] trait is the interface used by the frame logger. The
//! only format is background-subtracted `.ufmf` ([UfmfVideoWriter]), which
//! runs its background model, compression and file output on worker threads
//! so that [VideoWriter::add_frame] never waits on disk I/O.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use stamped_frame::StampedFrame;

/// Return early with the first error reported by a worker thread.
macro_rules! async_err {
    ($rx: expr) => {
        if let Ok(e) = $rx.try_recv() {
            return Err(e);
        }
    };
}

/// Report an error from a worker thread and exit the thread.
macro_rules! thread_try {
    ($tx: expr, $result: expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => {
                let e = crate::Error::from(e);
                tracing::error!("{}:{}: {}", file!(), line!(), e);
                let _ = $tx.send(e);
                return; // exit the thread
            }
        }
    };
}

pub mod background;
pub mod compressor;
mod config;
pub mod sink;
mod ufmf_writer;

pub use config::UfmfConfig;
pub use ufmf_writer::{UfmfVideoWriter, WriterStats};

/// How long a worker waits on a queue before checking for a stop request.
pub(crate) const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported frame: {0}")]
    Format(String),
    #[error("frame count {current} does not follow {previous}")]
    OutOfOrder { previous: u64, current: u64 },
    #[error("{queue} queue depth {depth} exceeds maximum {max}")]
    QueueOverflow {
        queue: &'static str,
        depth: usize,
        max: usize,
    },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("ufmf error: {0}")]
    Ufmf(#[from] ufmf::UFMFError),
    #[error("numeric conversion: {0}")]
    Cast(#[from] cast::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pool(#[from] pipeline_sync::PoolError),
    #[error("already finished")]
    AlreadyFinished,
    #[error("no output file name set")]
    NoFileName,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A movie encoder fed one frame at a time.
pub trait VideoWriter: Send {
    /// Output path. Must be set before the first frame.
    fn set_file_name(&mut self, path: PathBuf);
    /// Keep only every `frame_skip`-th frame.
    fn set_frame_skip(&mut self, frame_skip: u32);
    fn add_frame(&mut self, frame: StampedFrame) -> Result<()>;
    /// Complete all pending work and close the output. The movie is not
    /// complete until this returns.
    fn finish(&mut self) -> Result<()>;
}

/// Output format and its settings.
///
/// In TOML this is a table whose `type` key names the format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VideoFormat {
    Ufmf(UfmfConfig),
}

impl Default for VideoFormat {
    fn default() -> Self {
        VideoFormat::Ufmf(UfmfConfig::default())
    }
}

impl VideoFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            VideoFormat::Ufmf(_) => "ufmf",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            VideoFormat::Ufmf(cfg) => cfg.validate(),
        }
    }

    pub fn new_writer(&self) -> Result<Box<dyn VideoWriter>> {
        match self {
            VideoFormat::Ufmf(cfg) => Ok(Box::new(UfmfVideoWriter::new(cfg.clone())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_toml() {
        let format: VideoFormat = toml::from_str("type = \"ufmf\"\nframe_skip = 2\n").unwrap();
        let VideoFormat::Ufmf(cfg) = &format;
        assert_eq!(cfg.frame_skip, 2);
        assert_eq!(cfg.background_threshold, 40);
        assert_eq!(format.extension(), "ufmf");
        assert!(toml::from_str::<VideoFormat>("type = \"avi\"\n").is_err());
    }
}
