pub mod display;
pub mod lexer;
pub mod parser;
pub mod types;

pub use parser::{parse, parse_with_base, ConfigError};
pub use types::{HttpRule, LocationRule, ServerConfig};

/// Reads and parses a configuration file from disk. `include` directives
/// inside it (and inside anything it includes) resolve relative to each
/// file's own directory.
pub fn load(path: &std::path::Path) -> Result<HttpRule, ConfigError> {
    let src = std::fs::read_to_string(path).map_err(|e| ConfigError {
        line: 0,
        col: 0,
        message: format!("cannot read {}: {e}", path.display()),
    })?;
    let base_dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
    parse_with_base(&src, base_dir)
}
