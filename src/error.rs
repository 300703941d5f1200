use std::fmt;

#[derive(Debug)]
pub enum CaptureError {
    InvalidRegion(String),

    /// No display output intersects the requested capture rectangle.
    NoSuitableAdapter,

    AccessLost,

    Timeout,

    UnsupportedFormat(String),

    BufferOverflow,

    InvalidConfig(String),

    /// An operation was called in a state that does not allow it, e.g.
    /// unlocking a bitmap that was never locked or configuring a codec
    /// after its session was opened.
    InvalidState(String),

    WorkerDead,

    /// The accelerated duplication backend cannot run on this
    /// platform/driver. Triggers the blit fallback.
    BackendUnsupported(String),

    BackendUnavailable(String),

    CodecInitialization(String),

    Encoding(String),

    UnsupportedMedia(String),

    Sink {
        sink: String,
        message: String,
    },

    Io(std::io::Error),

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl CaptureError {
    pub fn class(&self) -> CaptureErrorClass {
        match self {
            Self::InvalidRegion(_) | Self::InvalidConfig(_) | Self::InvalidState(_) => {
                CaptureErrorClass::InvalidInput
            }
            Self::UnsupportedFormat(_)
            | Self::BackendUnsupported(_)
            | Self::BackendUnavailable(_)
            | Self::NoSuitableAdapter
            | Self::UnsupportedMedia(_) => CaptureErrorClass::Unsupported,
            Self::AccessLost | Self::Timeout | Self::WorkerDead => CaptureErrorClass::Transient,
            Self::BufferOverflow
            | Self::CodecInitialization(_)
            | Self::Encoding(_)
            | Self::Sink { .. }
            | Self::Io(_)
            | Self::Platform(_) => CaptureErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), CaptureErrorClass::Transient)
    }

    /// The frame source that produced this error can no longer be used
    /// and must be dropped and recreated.
    pub fn requires_source_reset(&self) -> bool {
        matches!(self, Self::AccessLost | Self::WorkerDead)
    }

    /// Create a string-based copy of this error suitable for storing in
    /// reports and sending through channels. `Platform` loses its inner
    /// `anyhow::Error` chain and `Io` keeps only its kind and message.
    pub fn to_sendable(&self) -> Self {
        match self {
            Self::InvalidRegion(s) => Self::InvalidRegion(s.clone()),
            Self::NoSuitableAdapter => Self::NoSuitableAdapter,
            Self::AccessLost => Self::AccessLost,
            Self::Timeout => Self::Timeout,
            Self::UnsupportedFormat(s) => Self::UnsupportedFormat(s.clone()),
            Self::BufferOverflow => Self::BufferOverflow,
            Self::InvalidConfig(s) => Self::InvalidConfig(s.clone()),
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::WorkerDead => Self::WorkerDead,
            Self::BackendUnsupported(s) => Self::BackendUnsupported(s.clone()),
            Self::BackendUnavailable(s) => Self::BackendUnavailable(s.clone()),
            Self::CodecInitialization(s) => Self::CodecInitialization(s.clone()),
            Self::Encoding(s) => Self::Encoding(s.clone()),
            Self::UnsupportedMedia(s) => Self::UnsupportedMedia(s.clone()),
            Self::Sink { sink, message } => Self::Sink {
                sink: sink.clone(),
                message: message.clone(),
            },
            Self::Io(inner) => Self::Io(std::io::Error::new(inner.kind(), inner.to_string())),
            Self::Platform(inner) => Self::Platform(anyhow::anyhow!("{inner:#}")),
        }
    }

    pub(crate) fn sink(sink: &str, message: impl Into<String>) -> Self {
        Self::Sink {
            sink: sink.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegion(message) => write!(f, "invalid capture region: {message}"),
            Self::NoSuitableAdapter => {
                write!(f, "no suitable video adapter intersects the capture region")
            }
            Self::AccessLost => write!(f, "desktop duplication access lost"),
            Self::Timeout => write!(f, "failed to acquire desktop frame within timeout"),
            Self::UnsupportedFormat(fmt_name) => {
                write!(f, "unsupported pixel format: {fmt_name}")
            }
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::InvalidConfig(message) => write!(f, "invalid capture configuration: {message}"),
            Self::InvalidState(message) => write!(f, "invalid state: {message}"),
            Self::WorkerDead => write!(f, "capture worker is not running"),
            Self::BackendUnsupported(message) => {
                write!(f, "capture backend is not supported: {message}")
            }
            Self::BackendUnavailable(message) => {
                write!(f, "no available backend implementation: {message}")
            }
            Self::CodecInitialization(message) => {
                write!(f, "failed to initialize codec: {message}")
            }
            Self::Encoding(message) => write!(f, "encoding failed: {message}"),
            Self::UnsupportedMedia(message) => write!(f, "unsupported media: {message}"),
            Self::Sink { sink, message } => write!(f, "sink '{sink}' failed: {message}"),
            Self::Io(inner) => write!(f, "{inner}"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
