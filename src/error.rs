use std::fmt::{self, Debug, Display, Formatter};
use std::net::AddrParseError;

use crate::config::ConfigError;

/// Crate-wide error type. Startup-time failures (config, bind) are the only
/// ones that ever escape to `main`; per-request errors are converted into
/// HTTP responses inline and never propagate this far.
pub enum WebservError {
    Io(std::io::Error),
    Config(ConfigError),
    Addr(AddrParseError),
}

impl Debug for WebservError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "\r\x1b[K{}", self)
    }
}

impl Display for WebservError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WebservError::Io(e) => write!(f, "\x1b[31merror\x1b[0m: {e}"),
            WebservError::Config(e) => write!(f, "{e}"),
            WebservError::Addr(e) => write!(f, "\x1b[31merror\x1b[0m: invalid listen address: {e}"),
        }
    }
}

impl std::error::Error for WebservError {}

impl From<std::io::Error> for WebservError {
    fn from(e: std::io::Error) -> Self {
        WebservError::Io(e)
    }
}

impl From<ConfigError> for WebservError {
    fn from(e: ConfigError) -> Self {
        WebservError::Config(e)
    }
}

impl From<AddrParseError> for WebservError {
    fn from(e: AddrParseError) -> Self {
        WebservError::Addr(e)
    }
}

pub type Result<T> = std::result::Result<T, WebservError>;

/// Exit code convention for `main`: 0 clean shutdown, 1 configuration/usage error.
pub const EXIT_CONFIG_ERROR: i32 = 1;
