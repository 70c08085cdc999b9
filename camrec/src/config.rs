use std::{
    fmt::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use video_writer::VideoFormat;

use crate::{Error, Result};

fn default_grab_timeout_ms() -> u64 {
    100
}

fn default_queue_poll_ms() -> u64 {
    50
}

fn default_max_log_queue_size() -> usize {
    500
}

fn default_fps_averaging_frames() -> u64 {
    30
}

/// Settings for one capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Longest time the grabber blocks in the camera driver before checking
    /// for a stop request.
    #[serde(default = "default_grab_timeout_ms")]
    pub grab_timeout_ms: u64,
    /// Longest time the dispatcher and logger block on an empty queue before
    /// checking for a stop request.
    #[serde(default = "default_queue_poll_ms")]
    pub queue_poll_ms: u64,
    /// Maximum number of frames waiting for the video writer. Exceeding this
    /// stops the session.
    #[serde(default = "default_max_log_queue_size")]
    pub max_log_queue_size: usize,
    /// Number of frames over which the frame rate is averaged.
    #[serde(default = "default_fps_averaging_frames")]
    pub fps_averaging_frames: u64,
    /// Record to disk. `None` runs preview only.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grab_timeout_ms: default_grab_timeout_ms(),
            queue_poll_ms: default_queue_poll_ms(),
            max_log_queue_size: default_max_log_queue_size(),
            fps_averaging_frames: default_fps_averaging_frames(),
            logging: Some(LoggingConfig::default()),
        }
    }
}

impl SessionConfig {
    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grab_timeout_ms == 0 || self.queue_poll_ms == 0 {
            return Err(Error::Config(
                "grab_timeout_ms and queue_poll_ms must be positive".into(),
            ));
        }
        if self.max_log_queue_size == 0 {
            return Err(Error::Config("max_log_queue_size must be positive".into()));
        }
        if self.fps_averaging_frames == 0 {
            return Err(Error::Config(
                "fps_averaging_frames must be positive".into(),
            ));
        }
        if let Some(logging) = &self.logging {
            logging.validate()?;
        }
        Ok(())
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_filename_template() -> String {
    "movie%Y%m%d_%H%M%S.ufmf".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File name, formatted with the session start time using `strftime`
    /// syntax.
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
    #[serde(default)]
    pub format: VideoFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            filename_template: default_filename_template(),
            format: VideoFormat::default(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if self.filename_template.is_empty() {
            return Err(Error::Config("empty filename_template".into()));
        }
        let invalid = chrono::format::StrftimeItems::new(&self.filename_template)
            .any(|item| matches!(item, chrono::format::Item::Error));
        if invalid {
            return Err(Error::Config(format!(
                "invalid filename_template \"{}\"",
                self.filename_template
            )));
        }
        Ok(())
    }

    /// Path of the movie for a session started at `start`. An existing file
    /// is never reused.
    pub fn output_path<Tz>(&self, start: &DateTime<Tz>) -> Result<PathBuf>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let mut name = String::new();
        write!(name, "{}", start.format(&self.filename_template)).map_err(|_| {
            Error::Config(format!(
                "invalid filename_template \"{}\"",
                self.filename_template
            ))
        })?;
        Ok(unique_path(&self.output_dir.join(name)))
    }
}

/// Return `path`, or if it exists, the first of `stem_1.ext`, `stem_2.ext`,
/// ... which does not.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut i = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}_{i}.{ext}"),
            None => format!("{stem}_{i}"),
        };
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_output_path_from_template() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoggingConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = cfg.output_path(&start).unwrap();
        assert_eq!(path, dir.path().join("movie20240309_140507.ufmf"));

        std::fs::write(&path, b"").unwrap();
        let second = cfg.output_path(&start).unwrap();
        assert_eq!(second, dir.path().join("movie20240309_140507_1.ufmf"));
        std::fs::write(&second, b"").unwrap();
        assert_eq!(
            cfg.output_path(&start).unwrap(),
            dir.path().join("movie20240309_140507_2.ufmf")
        );
    }

    #[test]
    fn test_validation() {
        SessionConfig::default().validate().unwrap();
        let cfg = SessionConfig {
            grab_timeout_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = SessionConfig {
            logging: Some(LoggingConfig {
                filename_template: "movie%Q.ufmf".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = SessionConfig::default();
        let buf = toml::to_string(&cfg).unwrap();
        let loaded: SessionConfig = toml::from_str(&buf).unwrap();
        assert_eq!(cfg, loaded);

        let minimal: SessionConfig = toml::from_str("max_log_queue_size = 7").unwrap();
        assert_eq!(minimal.max_log_queue_size, 7);
        assert_eq!(minimal.grab_timeout_ms, 100);
        assert!(minimal.logging.is_none());
    }
}
