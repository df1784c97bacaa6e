//! Convenience re-exports for the crate's internal modules, imported with
//! `use crate::prelude::*;` at call sites that touch several of them.

pub use crate::cgi::{CgiEnv, CgiResponse};
pub use crate::client::{Client, ClientOutcome, ClientState};
pub use crate::config::{self, ConfigError, HttpRule, LocationRule, ServerConfig};
pub use crate::error::{Result, WebservError};
pub use crate::fd::{BufferedIo, FdState};
pub use crate::http::{BodyMode, HeaderMap, HeaderName, Method, Request, Response, ResponseKind};
pub use crate::iobuf::{BodySource, BodyWriter, ChunkExtract, ChunkStatus, InBuffer};
pub use crate::path;
pub use crate::poller::{Poller, ReadyMask};
pub use crate::server::Server;
pub use crate::timer::{Timer, TimerCallback, TimerId};

pub use proxy_log::{debug, error, info, trace, warn};

pub use mio::{Interest, Token};

pub use std::collections::HashMap;
pub use std::io::{self, Read, Write};
pub use std::path::{Path, PathBuf};
pub use std::time::{Duration, Instant};
