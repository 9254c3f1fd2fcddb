/// Result alias that carries the custom [`BeatCueError`] type.
pub type Result<T> = std::result::Result<T, BeatCueError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatCueError {
    /// The live performance state could not be read. Fatal at startup, tolerated
    /// afterwards by reusing the last good sample.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// A timeline file is malformed. `line` is 1-based.
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },
    /// Invalid configuration, such as an unknown target version.
    #[error("configuration error: {0}")]
    Config(String),
    /// An outbound batch could not be delivered. Logged and dropped.
    #[error("transmit error: {0}")]
    Transmit(String),
    /// Free-form message for conditions that fit none of the above.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BeatCueError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn parse<T: Into<String>>(line: usize, message: T) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }
}

impl From<&str> for BeatCueError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatCueError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<toml::de::Error> for BeatCueError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}
