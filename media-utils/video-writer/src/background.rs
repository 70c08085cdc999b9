//! Running median background model.
//!
//! Sampled frames are binned into a per-pixel intensity histogram by the
//! histogram worker. Once enough samples have accumulated, the histogram is
//! moved to the median worker, which reduces it to a new [BackgroundModel] and
//! hands the emptied histogram back for reuse.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crossbeam_channel::Sender;
use machine_vision_formats::{ImageData, ImageStride, owned::OImage, pixel_format::Mono8};
use pipeline_sync::SynchronizedQueue;
use stamped_frame::StampedFrame;
use tracing::{debug, error};

use crate::{Error, Result, WORKER_POLL_INTERVAL};

/// Per-pixel median image and the foreground decision bounds derived from it.
///
/// Never modified after construction. A newer model replaces an older one.
#[derive(Clone)]
pub struct BackgroundModel {
    generation: u64,
    median: OImage<Mono8>,
    lower: Vec<u8>,
    upper: Vec<u8>,
    timestamp: f64,
}

impl std::fmt::Debug for BackgroundModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundModel")
            .field("generation", &self.generation)
            .field("width", &self.width())
            .field("height", &self.height())
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl BackgroundModel {
    /// Seed a model (generation 0) directly from an image.
    pub fn from_image(
        image: &dyn ImageStride<Mono8>,
        threshold: u8,
        timestamp: f64,
    ) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Format(format!(
                "empty background image {}x{}",
                image.width(),
                image.height()
            )));
        }
        let width = image.width() as usize;
        let mut median = Vec::with_capacity(width * image.height() as usize);
        let rows = image.image_data().chunks(image.stride());
        for row in rows.take(image.height() as usize) {
            median.extend_from_slice(&row[..width]);
        }
        Self::from_median(
            0,
            image.width(),
            image.height(),
            median,
            threshold,
            timestamp,
        )
    }

    /// `median` is row-major without padding.
    pub fn from_median(
        generation: u64,
        width: u32,
        height: u32,
        median: Vec<u8>,
        threshold: u8,
        timestamp: f64,
    ) -> Result<Self> {
        let actual = median.len();
        let median = OImage::new(width, height, width as usize, median).ok_or_else(|| {
            Error::Encode(format!(
                "median of {actual} bytes does not fill {width}x{height}"
            ))
        })?;
        let lower = median
            .image_data()
            .iter()
            .map(|m| m.saturating_sub(threshold))
            .collect();
        let upper = median
            .image_data()
            .iter()
            .map(|m| m.saturating_add(threshold))
            .collect();
        Ok(Self {
            generation,
            median,
            lower,
            upper,
            timestamp,
        })
    }

    /// Increases by one with every published model. The seed is 0.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn width(&self) -> u32 {
        self.median.width()
    }

    pub fn height(&self) -> u32 {
        self.median.height()
    }

    /// Row-major median estimate without padding.
    pub fn median(&self) -> &[u8] {
        self.median.image_data()
    }

    pub fn median_image(&self) -> &OImage<Mono8> {
        &self.median
    }

    pub fn lower(&self) -> &[u8] {
        &self.lower
    }

    pub fn upper(&self) -> &[u8] {
        &self.upper
    }

    /// Timestamp of the newest sample that contributed to this model.
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

/// Per-pixel histogram of sampled intensities.
pub struct BackgroundHistogram {
    width: u32,
    height: u32,
    num_bins: usize,
    bin_size: usize,
    /// `num_bins` counters per pixel, pixel-major.
    bins: Vec<u32>,
    /// Samples per pixel.
    counts: Vec<u32>,
    n_images: u32,
    first_timestamp: Option<f64>,
    last_timestamp: f64,
}

impl std::fmt::Debug for BackgroundHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundHistogram")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("num_bins", &self.num_bins)
            .field("n_images", &self.n_images)
            .finish_non_exhaustive()
    }
}

impl BackgroundHistogram {
    pub fn new(width: u32, height: u32, num_bins: u32, bin_size: u32) -> Self {
        let n_pixels = width as usize * height as usize;
        let num_bins = num_bins as usize;
        Self {
            width,
            height,
            num_bins,
            bin_size: bin_size as usize,
            bins: vec![0; n_pixels * num_bins],
            counts: vec![0; n_pixels],
            n_images: 0,
            first_timestamp: None,
            last_timestamp: 0.0,
        }
    }

    pub fn add_image(&mut self, image: &dyn ImageStride<Mono8>, timestamp: f64) -> Result<()> {
        if image.width() != self.width || image.height() != self.height {
            return Err(Error::Encode(format!(
                "background sample is {}x{}, expected {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            )));
        }
        let last_bin = self.num_bins - 1;
        let width = self.width as usize;
        let mut pixel = 0;
        let rows = image.image_data().chunks(image.stride());
        for row in rows.take(self.height as usize) {
            for &value in &row[..width] {
                let bin = (usize::from(value) / self.bin_size).min(last_bin);
                self.bins[pixel * self.num_bins + bin] += 1;
                self.counts[pixel] += 1;
                pixel += 1;
            }
        }
        self.n_images += 1;
        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = timestamp;
        Ok(())
    }

    /// Number of images added since the last clear.
    pub fn n_images(&self) -> u32 {
        self.n_images
    }

    /// Seconds between the first and last sample.
    pub fn time_span(&self) -> f64 {
        match self.first_timestamp {
            Some(first) => self.last_timestamp - first,
            None => 0.0,
        }
    }

    pub fn last_timestamp(&self) -> f64 {
        self.last_timestamp
    }

    /// Compute the per-pixel median.
    ///
    /// The median bin of a pixel is the first bin at which the cumulative
    /// count reaches half of the pixel's samples; its center is the estimate.
    /// Pixels without samples keep their value from `prior`.
    pub fn median(&self, prior: &[u8]) -> Vec<u8> {
        let mut result = prior.to_vec();
        for (pixel, out) in result.iter_mut().enumerate() {
            let total = self.counts[pixel];
            if total == 0 {
                continue;
            }
            let bins = &self.bins[pixel * self.num_bins..(pixel + 1) * self.num_bins];
            let mut cumulative = 0;
            for (bin, count) in bins.iter().enumerate() {
                cumulative += count;
                if 2 * cumulative >= total {
                    let center = bin * self.bin_size + self.bin_size / 2;
                    *out = center.min(255) as u8;
                    break;
                }
            }
        }
        result
    }

    pub fn clear(&mut self) {
        self.bins.fill(0);
        self.counts.fill(0);
        self.n_images = 0;
        self.first_timestamp = None;
        self.last_timestamp = 0.0;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HistogramParams {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) num_bins: u32,
    pub(crate) bin_size: u32,
    pub(crate) median_update_count: u32,
    pub(crate) median_update_interval: f64,
}

/// Queues connecting the encoder and the two background workers.
#[derive(Default)]
pub(crate) struct BackgroundQueues {
    /// Frames offered for sampling. Holds at most one frame.
    pub(crate) images: SynchronizedQueue<StampedFrame>,
    /// Filled histograms awaiting reduction.
    pub(crate) new_data: SynchronizedQueue<BackgroundHistogram>,
    /// Emptied histograms available for reuse.
    pub(crate) recycle: SynchronizedQueue<BackgroundHistogram>,
    /// The newest published model, if not yet picked up.
    pub(crate) models: SynchronizedQueue<Arc<BackgroundModel>>,
}

impl BackgroundQueues {
    pub(crate) fn signal_all(&self) {
        self.images.signal_not_empty();
        self.new_data.signal_not_empty();
    }

    pub(crate) fn clear(&self) {
        self.images.clear();
        self.new_data.clear();
        self.recycle.clear();
        self.models.clear();
    }
}

pub(crate) fn histogram_worker(
    queues: Arc<BackgroundQueues>,
    params: HistogramParams,
    samples: Arc<AtomicU64>,
    flag: thread_control::Flag,
    err_tx: Sender<Error>,
) {
    let mut current: Option<BackgroundHistogram> = None;
    while flag.alive() {
        let Some(frame) = queues.images.pop_timeout(WORKER_POLL_INTERVAL) else {
            continue;
        };
        let image = thread_try!(
            err_tx,
            frame.image.as_mono8().ok_or_else(|| Error::Format(format!(
                "background sample has pixel format {}",
                frame.pixel_format()
            )))
        );
        let hist = current.get_or_insert_with(|| {
            queues.recycle.try_pop().unwrap_or_else(|| {
                BackgroundHistogram::new(
                    params.width,
                    params.height,
                    params.num_bins,
                    params.bin_size,
                )
            })
        });
        thread_try!(err_tx, hist.add_image(image, frame.timestamp));
        samples.fetch_add(1, Ordering::Relaxed);

        if hist.n_images() >= params.median_update_count
            && hist.time_span() >= params.median_update_interval
        {
            // If the median worker is still busy, keep accumulating.
            let mut new_data = queues.new_data.acquire();
            if new_data.is_empty() {
                if let Some(hist) = current.take() {
                    debug!("histogram of {} samples ready", hist.n_images());
                    new_data.push(hist);
                }
            }
        }
    }
    debug!("histogram worker done");
}

pub(crate) fn median_worker(
    queues: Arc<BackgroundQueues>,
    seed: Arc<BackgroundModel>,
    threshold: u8,
    updates: Arc<AtomicU64>,
    flag: thread_control::Flag,
    err_tx: Sender<Error>,
) {
    let mut prior = seed;
    while flag.alive() {
        let Some(mut hist) = queues.new_data.pop_timeout(WORKER_POLL_INTERVAL) else {
            continue;
        };
        if hist.n_images() == 0 {
            error!("received empty background histogram");
            continue;
        }
        let median = hist.median(prior.median());
        let model = Arc::new(thread_try!(
            err_tx,
            BackgroundModel::from_median(
                prior.generation() + 1,
                prior.width(),
                prior.height(),
                median,
                threshold,
                hist.last_timestamp(),
            )
        ));
        {
            let mut models = queues.models.acquire();
            models.clear();
            models.push(model.clone());
        }
        updates.fetch_add(1, Ordering::Relaxed);
        debug!(
            "published background model {} from {} samples",
            model.generation(),
            hist.n_images()
        );
        prior = model;
        hist.clear();
        queues.recycle.push(hist);
    }
    debug!("median worker done");
}
