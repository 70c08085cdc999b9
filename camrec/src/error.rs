/// Coarse classification of session errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Camera driver failure, including starting or stopping acquisition.
    Capture,
    /// A frame the encoder cannot handle.
    Format,
    /// A pipeline stage fell too far behind.
    QueueOverflow,
    /// Failure while modelling or compressing frames.
    Encode,
    /// Failure writing output.
    Io,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capture error: {0}")]
    Capture(#[from] ci2::Error),
    #[error("failed to start capture: {0}")]
    StartCapture(#[source] ci2::Error),
    #[error("failed to stop capture: {0}")]
    StopCapture(#[source] ci2::Error),
    #[error("image logger max queue size exceeded ({depth} > {max})")]
    LogQueueOverflow { depth: usize, max: usize },
    #[error("video writer error: {0}")]
    VideoWriter(#[from] video_writer::Error),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Pool(#[from] pipeline_sync::PoolError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn _test_error_is_send() {
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use video_writer::Error as W;
        match self {
            Error::Capture(_) | Error::StartCapture(_) | Error::StopCapture(_) => {
                ErrorKind::Capture
            }
            Error::LogQueueOverflow { .. } => ErrorKind::QueueOverflow,
            Error::VideoWriter(e) => match e {
                W::Format(_) | W::OutOfOrder { .. } => ErrorKind::Format,
                W::QueueOverflow { .. } => ErrorKind::QueueOverflow,
                W::Io { .. } | W::Ufmf(ufmf::UFMFError::Io(_)) => ErrorKind::Io,
                W::Config(_) | W::NoFileName => ErrorKind::Config,
                W::Encode(_)
                | W::Ufmf(_)
                | W::Cast(_)
                | W::Pool(_)
                | W::AlreadyFinished => ErrorKind::Encode,
            },
            Error::Io { .. } => ErrorKind::Io,
            Error::Config(_) => ErrorKind::Config,
            Error::Pool(pipeline_sync::PoolError::Spawn { .. }) => ErrorKind::Io,
            Error::Pool(_) => ErrorKind::Encode,
        }
    }

    /// Whether the session must stop. Only a failure to stop acquisition,
    /// which happens while already stopping, is not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::StopCapture(_))
    }
}
