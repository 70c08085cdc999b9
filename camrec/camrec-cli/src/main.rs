use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use clap::Parser;
use crossbeam_channel::select;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use camrec::{LoggingConfig, Session, SessionConfig};
use ci2::{
    Camera, CameraInfo,
    synthetic::{SyntheticCamera, SyntheticCameraConfig},
};

mod logging;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration TOML file. Defaults are used if not given.
    #[arg(short, long, value_name = "CONFIG_TOML")]
    config: Option<PathBuf>,

    /// Stop after this many seconds. Runs until Ctrl-C if not given.
    #[arg(short, long)]
    duration: Option<f64>,

    /// Directory for the movie, overriding the configuration.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Preview only, do not record.
    #[arg(long)]
    no_logging: bool,

    /// Also write log messages to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the default configuration TOML and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CliConfig {
    #[serde(default)]
    camera: SyntheticCameraConfig,
    #[serde(default)]
    session: SessionConfig,
}

fn load_config(path: &Path) -> Result<CliConfig> {
    let buf = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file \"{}\"", path.display()))?;
    let cfg: CliConfig = toml::from_str(&buf)
        .with_context(|| format!("parsing config file \"{}\"", path.display()))?;
    Ok(cfg)
}

fn apply_args(mut cfg: CliConfig, cli: &Cli) -> CliConfig {
    if cli.no_logging {
        cfg.session.logging = None;
    } else if let Some(dir) = &cli.output_dir {
        cfg.session
            .logging
            .get_or_insert_with(LoggingConfig::default)
            .output_dir = dir.clone();
    }
    cfg
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        print!("{}", toml::to_string(&CliConfig::default())?);
        return Ok(());
    }

    let _guard = logging::initiate_logging(cli.log_file.as_ref())?;

    let cfg = match &cli.config {
        Some(path) => load_config(path)?,
        None => CliConfig::default(),
    };
    let cfg = apply_args(cfg, &cli);

    let mut camera = SyntheticCamera::new(cfg.camera.clone());
    camera.connect()?;
    info!(
        "camera {} {}x{} at {} fps",
        camera.name(),
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.fps
    );

    let mut session = Session::start(ci2::shared(camera), cfg.session)?;
    if let Some(path) = session.output_path() {
        info!("saving to \"{}\"", path.display());
    }

    let (quit_tx, quit_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        info!("got Ctrl-C, shutting down");
        let _ = quit_tx.try_send(());
    })
    .wrap_err("setting Ctrl-C handler")?;

    let deadline = cli
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let errors = session.errors();
    let mut failure = None;
    loop {
        let tick = crossbeam_channel::after(Duration::from_secs(1));
        select! {
            recv(quit_rx) -> _ => break,
            recv(errors) -> msg => match msg {
                Ok(e) if e.is_fatal() => {
                    error!("stopping: {e}");
                    failure = Some(e);
                    break;
                }
                Ok(e) => warn!("{e}"),
                Err(_) => break,
            },
            recv(tick) -> _ => {
                let stats = session.stats();
                info!(
                    "frame {}: {:.1} fps, {} dropped",
                    stats.frame_count, stats.fps, stats.frames_dropped
                );
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if !session.is_running() {
            break;
        }
    }

    session.stop()?;
    // Errors raised while stopping.
    for e in errors.try_iter() {
        warn!("{e}");
    }
    if let Some(path) = session.output_path() {
        info!("saved \"{}\"", path.display());
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_default_config_roundtrips_toml() {
        let buf = toml::to_string(&CliConfig::default()).unwrap();
        let cfg: CliConfig = toml::from_str(&buf).unwrap();
        assert_eq!(cfg, CliConfig::default());
    }

    #[test]
    fn test_partial_config() {
        let cfg: CliConfig = toml::from_str(
            r#"
            [camera]
            fps = 30.0

            [session]
            max_log_queue_size = 100
            "#,
        )
        .unwrap();
        assert_eq!(cfg.camera.fps, 30.0);
        assert_eq!(cfg.camera.width, SyntheticCameraConfig::default().width);
        assert_eq!(cfg.session.max_log_queue_size, 100);
        // A session table without a logging table does not record.
        assert!(cfg.session.logging.is_none());
    }

    #[test]
    fn test_args_override_config() {
        let cli = Cli::parse_from(["camrec", "--output-dir", "/tmp/movies"]);
        let cfg = apply_args(CliConfig::default(), &cli);
        let logging = cfg.session.logging.unwrap();
        assert_eq!(logging.output_dir, PathBuf::from("/tmp/movies"));

        let cli = Cli::parse_from(["camrec", "--no-logging", "--output-dir", "/tmp/movies"]);
        let cfg = apply_args(CliConfig::default(), &cli);
        assert!(cfg.session.logging.is_none());
    }
}
