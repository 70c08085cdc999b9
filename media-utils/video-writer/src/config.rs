use std::path::PathBuf;

use pipeline_sync::MAX_THREAD_COUNT;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Background subtraction encoder settings.
///
/// Fixed for the lifetime of one recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UfmfConfig {
    /// Only every `frame_skip`-th frame is sampled and saved.
    pub frame_skip: u32,
    /// Pixels differing from the background median by more than this are
    /// foreground.
    pub background_threshold: u32,
    /// Number of histogram bins per pixel.
    pub num_bins: u32,
    /// Width of each histogram bin in intensity units.
    pub bin_size: u32,
    /// Minimum number of sampled frames before a new median is computed.
    pub median_update_count: u32,
    /// Minimum time span, in seconds, covered by the sampled frames before a
    /// new median is computed.
    pub median_update_interval: f64,
    pub compressor_thread_count: usize,
    /// Maximum side length of a saved box. Larger foreground regions are
    /// split into tiles. Zero means unlimited.
    pub box_length: u32,
    /// Size of the square window used to dilate the foreground mask. Zero
    /// disables dilation.
    pub dilate_window: u32,
    /// Maximum number of frames waiting for a compressor.
    pub max_compressor_backlog: usize,
    /// Maximum number of compressed frames waiting to be written.
    pub max_finished_backlog: usize,
    /// Output file. Usually set per recording with
    /// [crate::VideoWriter::set_file_name] instead.
    pub output_path: Option<PathBuf>,
}

impl Default for UfmfConfig {
    fn default() -> Self {
        Self {
            frame_skip: 4,
            background_threshold: 40,
            num_bins: 64,
            bin_size: 4,
            median_update_count: 10,
            median_update_interval: 5.0,
            compressor_thread_count: 6,
            box_length: 0,
            dilate_window: 0,
            max_compressor_backlog: 500,
            max_finished_backlog: 500,
            output_path: None,
        }
    }
}

impl UfmfConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_skip < 1 {
            return Err(Error::Config("frame_skip must be at least 1".into()));
        }
        if !(1..=255).contains(&self.background_threshold) {
            return Err(Error::Config(format!(
                "background_threshold {} not in range 1..=255",
                self.background_threshold
            )));
        }
        if self.num_bins < 1 || self.bin_size < 1 {
            return Err(Error::Config(
                "num_bins and bin_size must be at least 1".into(),
            ));
        }
        if u64::from(self.num_bins) * u64::from(self.bin_size) < 256 {
            return Err(Error::Config(format!(
                "{} bins of size {} do not cover the 8 bit intensity range",
                self.num_bins, self.bin_size
            )));
        }
        if self.median_update_count < 1 {
            return Err(Error::Config("median_update_count must be at least 1".into()));
        }
        if !(self.median_update_interval.is_finite() && self.median_update_interval >= 0.0) {
            return Err(Error::Config(format!(
                "invalid median_update_interval {}",
                self.median_update_interval
            )));
        }
        let max_compressors = MAX_THREAD_COUNT - 2;
        if !(1..=max_compressors).contains(&self.compressor_thread_count) {
            return Err(Error::Config(format!(
                "compressor_thread_count {} not in range 1..={max_compressors}",
                self.compressor_thread_count
            )));
        }
        if self.box_length != 0 && !(2..=1024).contains(&self.box_length) {
            return Err(Error::Config(format!(
                "box_length {} not 0 or in range 2..=1024",
                self.box_length
            )));
        }
        if self.dilate_window != 0 && (self.dilate_window < 3 || self.dilate_window % 2 == 0) {
            return Err(Error::Config(format!(
                "dilate_window {} must be 0 or an odd number of at least 3",
                self.dilate_window
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        UfmfConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range() {
        let bad = [
            UfmfConfig {
                frame_skip: 0,
                ..Default::default()
            },
            UfmfConfig {
                background_threshold: 256,
                ..Default::default()
            },
            UfmfConfig {
                num_bins: 10,
                ..Default::default()
            },
            UfmfConfig {
                compressor_thread_count: MAX_THREAD_COUNT,
                ..Default::default()
            },
            UfmfConfig {
                box_length: 1,
                ..Default::default()
            },
            UfmfConfig {
                dilate_window: 4,
                ..Default::default()
            },
        ];
        for cfg in bad.iter() {
            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{cfg:?}");
        }
    }

    #[test]
    fn test_toml_partial() {
        let cfg: UfmfConfig = toml::from_str("frame_skip = 1\nbox_length = 64\n").unwrap();
        assert_eq!(cfg.frame_skip, 1);
        assert_eq!(cfg.box_length, 64);
        assert_eq!(cfg.num_bins, 64);
    }
}
