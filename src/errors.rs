//! Hand-rolled error enums for the hub's fallible boundaries.
//!
//! No `anyhow`/`thiserror`: each enum carries exactly the variants its
//! boundary can produce, with a plain `Display` and `std::error::Error` impl.

/// Failure parsing a client-originated WebSocket frame.
///
/// Absorbed into a counter by `Connection::run_reader`; never propagated
/// past the connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    NotUtf8,
    InvalidJson(String),
    MissingField(&'static str),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::NotUtf8 => write!(f, "frame is not valid UTF-8"),
            EnvelopeError::InvalidJson(msg) => write!(f, "invalid JSON envelope: {msg}"),
            EnvelopeError::MissingField(field) => write!(f, "envelope missing field: {field}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// An invalid or missing environment value at startup.
///
/// The only error type allowed to reach `main` and terminate the process
/// with a non-zero exit code.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Invalid { key: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, reason } => {
                write!(f, "invalid configuration for {key}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Admission was refused at the WebSocket upgrade boundary.
///
/// Turned directly into a close code; this is expected traffic shaping,
/// not a defect, and is counted rather than logged as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    CapacityExceeded,
    Overloaded,
    AuthRejected,
}

impl AcceptError {
    pub fn close_code(self) -> u16 {
        match self {
            AcceptError::CapacityExceeded => 1013,
            AcceptError::Overloaded => 1013,
            AcceptError::AuthRejected => 1008,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            AcceptError::CapacityExceeded => "at capacity",
            AcceptError::Overloaded => "overloaded",
            AcceptError::AuthRejected => "auth rejected",
        }
    }
}

impl std::fmt::Display for AcceptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for AcceptError {}
