use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use machine_vision_formats::pixel_format::PixFmt;
use parking_lot::Mutex;
use stamped_frame::{Image, StampedFrame};
use test_log::test;
use video_writer::{
    Error, Result, UfmfConfig, UfmfVideoWriter, VideoWriter,
    background::BackgroundModel,
    compressor::CompressedFrame,
    sink::FrameSink,
};

#[derive(Default)]
struct Recorded {
    /// Generation and median of each background written.
    backgrounds: Vec<(u64, Vec<u8>)>,
    frames: Vec<CompressedFrame>,
    closed: bool,
}

#[derive(Clone, Default)]
struct CollectingSink {
    recorded: Arc<Mutex<Recorded>>,
    /// Time spent in each `write_frame` call.
    write_delay: Duration,
}

impl FrameSink for CollectingSink {
    fn write_background(&mut self, model: &BackgroundModel) -> Result<()> {
        self.recorded
            .lock()
            .backgrounds
            .push((model.generation(), model.median().to_vec()));
        Ok(())
    }
    fn write_frame(&mut self, frame: &CompressedFrame) -> Result<()> {
        std::thread::sleep(self.write_delay);
        self.recorded.lock().frames.push(frame.clone());
        Ok(())
    }
    fn close(&mut self) -> Result<()> {
        self.recorded.lock().closed = true;
        Ok(())
    }
}

const W: u32 = 32;
const H: u32 = 24;

fn frame(frame_count: u64, image: Image) -> StampedFrame {
    StampedFrame::new(image, frame_count, frame_count as f64 * 0.01, chrono::Utc::now())
}

fn writer_with_sink(cfg: UfmfConfig) -> (UfmfVideoWriter, Arc<Mutex<Recorded>>) {
    writer_with_slow_sink(cfg, Duration::ZERO)
}

fn writer_with_slow_sink(
    cfg: UfmfConfig,
    write_delay: Duration,
) -> (UfmfVideoWriter, Arc<Mutex<Recorded>>) {
    let sink = CollectingSink {
        write_delay,
        ..Default::default()
    };
    let recorded = sink.recorded.clone();
    let writer = UfmfVideoWriter::with_sink(cfg, Box::new(sink)).unwrap();
    (writer, recorded)
}

fn no_skip() -> UfmfConfig {
    UfmfConfig {
        frame_skip: 1,
        compressor_thread_count: 3,
        ..Default::default()
    }
}

#[test]
fn test_identical_frames_have_no_boxes() {
    let (mut writer, recorded) = writer_with_sink(no_skip());
    for i in 0..20 {
        writer
            .add_frame(frame(i, Image::filled_mono8(W, H, 77).unwrap()))
            .unwrap();
    }
    writer.finish().unwrap();

    let recorded = recorded.lock();
    assert!(recorded.closed);
    assert_eq!(recorded.frames.len(), 20);
    for (i, f) in recorded.frames.iter().enumerate() {
        assert_eq!(f.frame_count, i as u64, "frames written in order");
        assert!(f.boxes.is_empty());
    }
    assert_eq!(recorded.backgrounds[0].0, 0);
    assert_eq!(recorded.backgrounds[0].1, vec![77; (W * H) as usize]);
}

#[test]
fn test_single_altered_region() {
    let (mut writer, recorded) = writer_with_sink(no_skip());
    writer
        .add_frame(frame(0, Image::filled_mono8(W, H, 50).unwrap()))
        .unwrap();
    let mut data = vec![50; (W * H) as usize];
    for y in 5..15 {
        for x in 10..20 {
            data[(y * W + x) as usize] = 200;
        }
    }
    let altered = Image::mono8(W, H, data).unwrap();
    writer.add_frame(frame(1, altered)).unwrap();
    writer.finish().unwrap();

    let recorded = recorded.lock();
    assert_eq!(recorded.frames.len(), 2);
    assert!(recorded.frames[0].boxes.is_empty());
    let boxes = &recorded.frames[1].boxes;
    assert_eq!(boxes.len(), 1);
    let b = &boxes[0];
    assert_eq!((b.x0, b.y0, b.width, b.height), (10, 5, 10, 10));
    assert!(b.pixels.iter().all(|&p| p == 200));
}

#[test]
fn test_frame_skip() {
    let cfg = UfmfConfig {
        frame_skip: 4,
        ..no_skip()
    };
    let (mut writer, recorded) = writer_with_sink(cfg);
    for i in 0..100 {
        writer
            .add_frame(frame(i, Image::filled_mono8(W, H, 10).unwrap()))
            .unwrap();
    }
    let stats = writer.stats();
    assert_eq!(stats.frames_added, 100);
    assert_eq!(stats.frames_offered, 25);
    assert_eq!(stats.frames_submitted, 25);
    assert!(stats.frames_sampled >= 1 && stats.frames_sampled <= 25);
    writer.finish().unwrap();

    let stats = writer.stats();
    assert_eq!(stats.frames_compressed, 25);
    assert_eq!(stats.frames_written, 25);
    let recorded = recorded.lock();
    let written: Vec<u64> = recorded.frames.iter().map(|f| f.frame_count).collect();
    let expected: Vec<u64> = (0..100).step_by(4).collect();
    assert_eq!(written, expected);
}

#[test]
fn test_set_frame_skip_overrides_config() {
    let (mut writer, recorded) = writer_with_sink(no_skip());
    writer.set_frame_skip(10);
    for i in 0..30 {
        writer
            .add_frame(frame(i, Image::filled_mono8(W, H, 10).unwrap()))
            .unwrap();
    }
    writer.finish().unwrap();
    assert_eq!(recorded.lock().frames.len(), 3);
}

#[test]
fn test_nothing_written_after_finish() {
    let (mut writer, recorded) = writer_with_sink(no_skip());
    for i in 0..50 {
        writer
            .add_frame(frame(i, Image::filled_mono8(W, H, 10).unwrap()))
            .unwrap();
    }
    writer.finish().unwrap();
    let n = recorded.lock().frames.len();
    assert_eq!(n, 50);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(recorded.lock().frames.len(), n);
    assert!(matches!(
        writer.add_frame(frame(50, Image::filled_mono8(W, H, 10).unwrap())),
        Err(Error::AlreadyFinished)
    ));
    // Finishing again is harmless.
    writer.finish().unwrap();
}

#[test]
fn test_rejects_color_frames() {
    let (mut writer, _recorded) = writer_with_sink(no_skip());
    let rgb = Image::new(W, H, (W * 3) as usize, PixFmt::RGB8, vec![0; (W * H * 3) as usize])
        .unwrap();
    assert!(matches!(
        writer.add_frame(frame(0, rgb)),
        Err(Error::Format(_))
    ));
}

#[test]
fn test_rejects_size_change_and_reordering() {
    let (mut writer, _recorded) = writer_with_sink(no_skip());
    writer
        .add_frame(frame(5, Image::filled_mono8(W, H, 0).unwrap()))
        .unwrap();
    assert!(matches!(
        writer.add_frame(frame(6, Image::filled_mono8(W + 2, H, 0).unwrap())),
        Err(Error::Format(_))
    ));
    assert!(matches!(
        writer.add_frame(frame(5, Image::filled_mono8(W, H, 0).unwrap())),
        Err(Error::OutOfOrder { previous: 5, .. })
    ));
    writer.finish().unwrap();
}

#[test]
fn test_background_update() {
    let cfg = UfmfConfig {
        frame_skip: 1,
        median_update_count: 2,
        median_update_interval: 0.0,
        compressor_thread_count: 2,
        ..Default::default()
    };
    let (mut writer, recorded) = writer_with_sink(cfg);
    writer
        .add_frame(frame(0, Image::filled_mono8(W, H, 20).unwrap()))
        .unwrap();

    // The scene changes to a brighter level. Eventually the background
    // catches up and frames stop having foreground.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut fno = 1;
    loop {
        writer
            .add_frame(frame(fno, Image::filled_mono8(W, H, 100).unwrap()))
            .unwrap();
        fno += 1;
        let caught_up = recorded
            .lock()
            .frames
            .iter()
            .any(|f| f.background.generation() > 0 && f.boxes.is_empty());
        if caught_up {
            break;
        }
        assert!(Instant::now() < deadline, "background never updated");
        std::thread::sleep(Duration::from_millis(5));
    }
    writer.finish().unwrap();
    assert!(writer.stats().background_updates >= 1);

    let recorded = recorded.lock();
    // The first changed frame is entirely foreground.
    let first = &recorded.frames[1];
    assert_eq!(first.background.generation(), 0);
    assert_eq!(first.boxes.len(), 1);
    assert_eq!(first.boxes[0].pixels.len(), (W * H) as usize);

    // One keyframe per background generation, in increasing order.
    let generations: Vec<u64> = recorded.backgrounds.iter().map(|b| b.0).collect();
    assert_eq!(generations[0], 0);
    assert!(generations.windows(2).all(|w| w[0] < w[1]));
    let (_, last_median) = recorded.backgrounds.last().unwrap();
    assert!(last_median.iter().all(|&m| m.abs_diff(100) <= 40));
}

#[test]
fn test_finished_backlog_overflow() {
    let cfg = UfmfConfig {
        max_finished_backlog: 3,
        ..no_skip()
    };
    let (mut writer, recorded) = writer_with_slow_sink(cfg, Duration::from_millis(200));

    // The serializer is stuck writing frame 0 while the compressors keep
    // finishing later frames.
    let mut overflow = None;
    for i in 0..20 {
        match writer.add_frame(frame(i, Image::filled_mono8(W, H, 10).unwrap())) {
            Ok(()) => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                overflow = Some((i, e));
                break;
            }
        }
    }
    let Some((rejected, err)) = overflow else {
        panic!("finished frame backlog never overflowed");
    };
    match err {
        Error::QueueOverflow { queue, depth, max } => {
            assert_eq!(queue, "finished frame");
            assert_eq!(max, 3);
            assert!(depth > 3);
        }
        other => panic!("expected QueueOverflow, got {other}"),
    }

    let stats = writer.stats();
    assert_eq!(stats.frames_submitted, rejected);
    // A rejected frame is not offered to the background model.
    assert!(stats.frames_sampled <= stats.frames_submitted);

    // Everything accepted before the overflow is still written.
    writer.finish().unwrap();
    let stats = writer.stats();
    assert_eq!(stats.frames_written, stats.frames_submitted);
    let written: Vec<u64> = recorded.lock().frames.iter().map(|f| f.frame_count).collect();
    assert_eq!(written, (0..rejected).collect::<Vec<u64>>());
}

#[test]
fn test_compressor_backlog_overflow() {
    const BIG: u32 = 512;
    let cfg = UfmfConfig {
        compressor_thread_count: 1,
        dilate_window: 31,
        max_compressor_backlog: 2,
        num_bins: 16,
        bin_size: 16,
        ..no_skip()
    };
    let (mut writer, recorded) = writer_with_sink(cfg);
    writer
        .add_frame(frame(0, Image::filled_mono8(BIG, BIG, 0).unwrap()))
        .unwrap();

    // Every pixel is foreground and dilated, so each frame keeps the single
    // compressor busy far longer than submitting one takes.
    let bright = frame(1, Image::filled_mono8(BIG, BIG, 200).unwrap());
    let mut overflow = None;
    for i in 1..200 {
        let mut next = bright.clone();
        next.frame_count = i;
        if let Err(e) = writer.add_frame(next) {
            overflow = Some((i, e));
            break;
        }
    }
    let Some((rejected, err)) = overflow else {
        panic!("compressor backlog never overflowed");
    };
    assert!(matches!(
        err,
        Error::QueueOverflow {
            queue: "compressor",
            max: 2,
            ..
        }
    ));
    assert_eq!(writer.stats().frames_submitted, rejected);

    writer.finish().unwrap();
    let stats = writer.stats();
    assert_eq!(stats.frames_compressed, rejected);
    assert_eq!(stats.frames_written, rejected);
    let recorded = recorded.lock();
    assert_eq!(recorded.frames.len() as u64, rejected);
    assert!(recorded.frames[1..].iter().all(|f| !f.boxes.is_empty()));
}

#[test]
fn test_ufmf_file_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.ufmf");
    let mut writer = UfmfVideoWriter::new(UfmfConfig::default()).unwrap();
    writer.set_file_name(path.clone());
    for i in 0..12 {
        writer
            .add_frame(frame(i, Image::filled_mono8(W, H, 30).unwrap()))
            .unwrap();
    }
    writer.finish().unwrap();
    assert_eq!(writer.stats().frames_written, 3);

    let buf = std::fs::read(&path).unwrap();
    assert_eq!(&buf[0..4], b"ufmf");
    assert_eq!(&buf[4..8], &3u32.to_le_bytes());
    assert_eq!(&buf[16..18], &(W as u16).to_le_bytes());
    assert_eq!(&buf[18..20], &(H as u16).to_le_bytes());
    assert_eq!(&buf[21..26], b"MONO8");
    let index_loc = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
    assert!(index_loc > 26 + (W * H) as usize);
    assert_eq!(buf[index_loc - 1], 2);
}

#[test]
fn test_missing_file_name() {
    let mut writer = UfmfVideoWriter::new(UfmfConfig::default()).unwrap();
    assert!(matches!(
        writer.add_frame(frame(0, Image::filled_mono8(W, H, 30).unwrap())),
        Err(Error::NoFileName)
    ));
}

#[test]
fn test_invalid_config() {
    let cfg = UfmfConfig {
        background_threshold: 0,
        ..Default::default()
    };
    assert!(matches!(UfmfVideoWriter::new(cfg), Err(Error::Config(_))));
}
