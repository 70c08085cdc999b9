use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Start logging to the console and optionally to a file.
///
/// The filter is taken from `RUST_LOG`, defaulting to `info`.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
) -> eyre::Result<impl Drop> {
    let file_layer = if let Some(path) = &path {
        let file = std::fs::File::create(path)?;
        let file_writer = std::sync::Mutex::new(file);
        Some(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    let with_ansi = !cfg!(windows);
    let console_layer = fmt::layer()
        .with_ansi(with_ansi)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = &path {
        tracing::debug!("Logging initiated to file \"{}\".", path.as_ref().display());
    }

    Ok(Guard {})
}
