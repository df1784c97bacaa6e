//! Recursive-descent parser over the token stream from `lexer.rs`, producing
//! an `HttpRule`. Grammar (informal):
//!
//! ```text
//! http_rule   := 'http' '{' http_directive* '}'
//! http_directive := 'server' '{' server_directive* '}'
//!                  | 'client_header_timeout' DURATION ';'
//!                  | 'keepalive_timeout' DURATION ';'
//! server_directive := 'listen' NUM ';' | 'server_name' WORD ';' | ...
//!                    | 'location' WORD '{' location_directive* '}'
//! ```
//!
//! `include <path>;` is not a grammar production of its own — it's expanded
//! by splicing the named file's tokens in place before the grammar above
//! ever runs, so it's legal anywhere any other directive is (http level,
//! inside `server`, inside `location`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::lexer::{tokenize, Token, TokenKind};
use super::types::{HttpRule, LocationRule, ServerConfig};

/// Bails out of a runaway `include` chain rather than hanging on a cycle.
const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\x1b[31mconfig error\x1b[0m at {}:{}: {}", self.line, self.col, self.message)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type PResult<T> = Result<T, ConfigError>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn err(&self, message: impl Into<String>) -> ConfigError {
        let (line, col) = self.peek().map(|t| (t.line, t.col)).unwrap_or((0, 0));
        ConfigError { line, col, message: message.into() }
    }

    fn expect_word(&mut self) -> PResult<String> {
        match self.advance() {
            Some(Token { kind: TokenKind::Word(w), .. }) => Ok(w),
            _ => Err(self.err("expected a word")),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<()> {
        match self.advance() {
            Some(t) if t.kind == kind => Ok(()),
            _ => Err(self.err(format!("expected {kind:?}"))),
        }
    }

    fn at_close_brace(&self) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::CloseBrace, .. }) | None)
    }
}

/// Parses a config with no base directory for `include` directives — any
/// `include` in `src` is resolved relative to the process's current
/// directory. Prefer `parse_with_base` when the source came from a file.
pub fn parse(src: &str) -> Result<HttpRule, ConfigError> {
    parse_with_base(src, Path::new("."))
}

pub fn parse_with_base(src: &str, base_dir: &Path) -> Result<HttpRule, ConfigError> {
    let tokens = tokenize(src).map_err(|e| ConfigError { line: e.line, col: e.col, message: e.message })?;
    let tokens = expand_includes(tokens, base_dir, 0)?;
    let mut p = Parser { tokens, pos: 0 };

    let mut rule = HttpRule {
        client_header_timeout: Duration::from_secs(60),
        keepalive_timeout: Duration::from_secs(75),
        servers: Vec::new(),
    };

    let mut defines: HashMap<String, String> = HashMap::new();

    let top = p.expect_word()?;
    if top != "http" {
        return Err(p.err("expected top-level 'http' block"));
    }
    p.expect(TokenKind::OpenBrace)?;

    while !p.at_close_brace() {
        let directive = p.expect_word()?;
        match directive.as_str() {
            "server" => {
                p.expect(TokenKind::OpenBrace)?;
                rule.servers.push(parse_server(&mut p, &defines)?);
            }
            "client_header_timeout" => {
                rule.client_header_timeout = parse_duration(&mut p)?;
                p.expect(TokenKind::Semicolon)?;
            }
            "keepalive_timeout" => {
                rule.keepalive_timeout = parse_duration(&mut p)?;
                p.expect(TokenKind::Semicolon)?;
            }
            "define" => {
                let name = p.expect_word()?;
                let value = p.expect_word()?;
                defines.insert(name, value);
                p.expect(TokenKind::Semicolon)?;
            }
            other => return Err(p.err(format!("unknown http directive '{other}'"))),
        }
    }
    p.expect(TokenKind::CloseBrace)?;

    if rule.servers.is_empty() {
        return Err(ConfigError { line: 0, col: 0, message: "no server blocks defined".into() });
    }

    Ok(rule)
}

/// Splices `include <path>;` directives into the surrounding file's own
/// contents before the recursive-descent parser ever sees them, so `include`
/// works anywhere a directive is legal — http level, inside `server`, or
/// inside `location`.
fn expand_includes(tokens: Vec<Token>, base_dir: &Path, depth: usize) -> Result<Vec<Token>, ConfigError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ConfigError { line: 0, col: 0, message: "include depth limit exceeded".into() });
    }

    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let is_include = matches!(&tokens[i].kind, TokenKind::Word(w) if w == "include");
        if !is_include {
            out.push(tokens[i].clone());
            i += 1;
            continue;
        }

        let at = &tokens[i];
        let path_token = tokens.get(i + 1).ok_or_else(|| ConfigError {
            line: at.line,
            col: at.col,
            message: "'include' expects a file path".into(),
        })?;
        let TokenKind::Word(raw_path) = &path_token.kind else {
            return Err(ConfigError { line: path_token.line, col: path_token.col, message: "'include' expects a file path".into() });
        };
        let semi = tokens.get(i + 2).ok_or_else(|| ConfigError {
            line: at.line,
            col: at.col,
            message: "'include' directive missing terminating ';'".into(),
        })?;
        if semi.kind != TokenKind::Semicolon {
            return Err(ConfigError { line: semi.line, col: semi.col, message: "'include' directive missing terminating ';'".into() });
        }

        let included_path = resolve_include_path(base_dir, raw_path);
        let included_src = std::fs::read_to_string(&included_path).map_err(|e| ConfigError {
            line: at.line,
            col: at.col,
            message: format!("cannot read included file {}: {e}", included_path.display()),
        })?;
        let included_tokens =
            tokenize(&included_src).map_err(|e| ConfigError { line: e.line, col: e.col, message: e.message })?;
        let included_base = included_path.parent().map(Path::to_path_buf).unwrap_or_else(|| base_dir.to_path_buf());
        let expanded = expand_includes(included_tokens, &included_base, depth + 1)?;
        out.extend(expanded);

        i += 3;
    }
    Ok(out)
}

fn resolve_include_path(base_dir: &Path, raw_path: &str) -> PathBuf {
    let candidate = Path::new(raw_path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    }
}

fn parse_duration(p: &mut Parser) -> PResult<Duration> {
    let raw = p.expect_word()?;
    parse_duration_str(&raw).ok_or_else(|| p.err(format!("invalid duration '{raw}'")))
}

fn parse_duration_str(raw: &str) -> Option<Duration> {
    let suffixes: &[(&str, u64)] = &[
        ("ns", 1),
        ("us", 1_000),
        ("ms", 1_000_000),
        ("s", 1_000_000_000),
        ("m", 60_000_000_000),
        ("h", 3_600_000_000_000),
        ("d", 86_400_000_000_000),
    ];
    for (suffix, ns_per_unit) in suffixes {
        if let Some(num) = raw.strip_suffix(suffix) {
            if let Ok(value) = num.parse::<u64>() {
                return Some(Duration::from_nanos(value * ns_per_unit));
            }
        }
    }
    raw.parse::<u64>().ok().map(Duration::from_secs)
}

fn parse_server(p: &mut Parser, defines: &HashMap<String, String>) -> PResult<ServerConfig> {
    let mut server = ServerConfig {
        port: 80,
        server_name: None,
        is_default: false,
        client_header_timeout: Duration::from_secs(60),
        client_max_body_size: 1024 * 1024,
        locations: Vec::new(),
        default_location: LocationRule::default(),
    };

    while !p.at_close_brace() {
        let directive = p.expect_word()?;
        match directive.as_str() {
            "listen" => {
                let raw = p.expect_word()?;
                server.port = resolve_define(&raw, defines).parse().map_err(|_| p.err("invalid port"))?;
                if matches!(p.peek(), Some(Token { kind: TokenKind::Word(w), .. }) if w == "default") {
                    p.advance();
                    server.is_default = true;
                }
                p.expect(TokenKind::Semicolon)?;
            }
            "server_name" => {
                server.server_name = Some(resolve_define(&p.expect_word()?, defines));
                p.expect(TokenKind::Semicolon)?;
            }
            "client_max_body_size" => {
                let raw = p.expect_word()?;
                server.client_max_body_size = parse_size(&raw).ok_or_else(|| p.err("invalid size"))?;
                server.default_location.max_body_size = server.client_max_body_size;
                p.expect(TokenKind::Semicolon)?;
            }
            "client_header_timeout" => {
                server.client_header_timeout = parse_duration(p)?;
                p.expect(TokenKind::Semicolon)?;
            }
            "root" => {
                server.default_location.root = Some(resolve_define(&p.expect_word()?, defines));
                p.expect(TokenKind::Semicolon)?;
            }
            "index" => {
                server.default_location.index = Some(parse_word_list(p)?);
                p.expect(TokenKind::Semicolon)?;
            }
            "error_page" => {
                let code: u16 = p.expect_word()?.parse().map_err(|_| p.err("invalid status code"))?;
                let path = resolve_define(&p.expect_word()?, defines);
                server.default_location.error_pages.insert(code, path);
                p.expect(TokenKind::Semicolon)?;
            }
            "location" => {
                let prefix = p.expect_word()?;
                p.expect(TokenKind::OpenBrace)?;
                let loc = parse_location(p, prefix, defines, &server.default_location)?;
                server.locations.push(loc);
            }
            other => return Err(p.err(format!("unknown server directive '{other}'"))),
        }
    }
    p.expect(TokenKind::CloseBrace)?;
    Ok(server)
}

fn parse_location(
    p: &mut Parser,
    prefix: String,
    defines: &HashMap<String, String>,
    server_default: &LocationRule,
) -> PResult<LocationRule> {
    let mut loc = LocationRule { prefix, ..server_default.clone() };

    while !p.at_close_brace() {
        let directive = p.expect_word()?;
        match directive.as_str() {
            "allowed_methods" => {
                let words = parse_word_list(p)?;
                loc.allowed_methods = words.iter().map(|w| w.parse().unwrap()).collect();
                p.expect(TokenKind::Semicolon)?;
            }
            "root" => {
                loc.root = Some(resolve_define(&p.expect_word()?, defines));
                p.expect(TokenKind::Semicolon)?;
            }
            "alias" => {
                loc.alias = Some(resolve_define(&p.expect_word()?, defines));
                p.expect(TokenKind::Semicolon)?;
            }
            "index" => {
                loc.index = Some(parse_word_list(p)?);
                p.expect(TokenKind::Semicolon)?;
            }
            "autoindex" => {
                loc.autoindex = p.expect_word()? == "on";
                p.expect(TokenKind::Semicolon)?;
            }
            "return" => {
                let code: u16 = p.expect_word()?.parse().map_err(|_| p.err("invalid return code"))?;
                let target = p.expect_word()?;
                loc.return_rule = Some((code, target));
                p.expect(TokenKind::Semicolon)?;
            }
            "upload_store" => {
                loc.upload_store = Some(resolve_define(&p.expect_word()?, defines));
                p.expect(TokenKind::Semicolon)?;
            }
            "error_page" => {
                let code: u16 = p.expect_word()?.parse().map_err(|_| p.err("invalid status code"))?;
                let path = resolve_define(&p.expect_word()?, defines);
                loc.error_pages.insert(code, path);
                p.expect(TokenKind::Semicolon)?;
            }
            "client_max_body_size" => {
                let raw = p.expect_word()?;
                loc.max_body_size = parse_size(&raw).ok_or_else(|| p.err("invalid size"))?;
                p.expect(TokenKind::Semicolon)?;
            }
            "cgi" => {
                loc.cgi = p.expect_word()? == "on";
                p.expect(TokenKind::Semicolon)?;
            }
            "cgi_extension" => {
                loc.cgi_extension = parse_word_list(p)?;
                p.expect(TokenKind::Semicolon)?;
            }
            "cgi_timeout" => {
                loc.cgi_timeout = parse_duration(p)?;
                p.expect(TokenKind::Semicolon)?;
            }
            "client_body_timeout" => {
                loc.client_body_timeout = parse_duration(p)?;
                p.expect(TokenKind::Semicolon)?;
            }
            other => return Err(p.err(format!("unknown location directive '{other}'"))),
        }
    }
    p.expect(TokenKind::CloseBrace)?;
    Ok(loc)
}

fn parse_word_list(p: &mut Parser) -> PResult<Vec<String>> {
    let mut words = Vec::new();
    while let Some(Token { kind: TokenKind::Word(_), .. }) = p.peek() {
        words.push(p.expect_word()?);
    }
    if words.is_empty() {
        return Err(p.err("expected at least one value"));
    }
    Ok(words)
}

fn resolve_define(raw: &str, defines: &HashMap<String, String>) -> String {
    if let Some(name) = raw.strip_prefix('$') {
        if let Some(value) = defines.get(name) {
            return value.clone();
        }
    }
    raw.to_string()
}

fn parse_size(raw: &str) -> Option<usize> {
    let suffixes: &[(&str, usize)] = &[("k", 1024), ("m", 1024 * 1024), ("g", 1024 * 1024 * 1024)];
    let lower = raw.to_lowercase();
    for (suffix, mult) in suffixes {
        if let Some(num) = lower.strip_suffix(suffix) {
            return num.parse::<usize>().ok().map(|n| n * mult);
        }
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        http {
            server {
                listen 8080;
                server_name example.com;
                root /var/www;
                location / {
                    allowed_methods GET;
                }
            }
        }
    "#;

    #[test]
    fn parses_minimal_config() {
        let rule = parse(MINIMAL).unwrap();
        assert_eq!(rule.servers.len(), 1);
        assert_eq!(rule.servers[0].port, 8080);
        assert_eq!(rule.servers[0].locations[0].prefix, "/");
    }

    #[test]
    fn duration_suffixes_parse() {
        assert_eq!(parse_duration_str("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_str("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration_str("1m"), Some(Duration::from_secs(60)));
    }

    #[test]
    fn size_suffixes_parse() {
        assert_eq!(parse_size("10m"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("512"), Some(512));
    }

    #[test]
    fn missing_http_wrapper_is_an_error() {
        assert!(parse("server { listen 80; }").is_err());
    }

    #[test]
    fn unknown_directive_reports_location() {
        let err = parse("http { server { bogus 1; } }").unwrap_err();
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn include_splices_a_location_block_from_another_file() {
        let dir = std::env::temp_dir().join(format!("webserv_include_test_{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let snippet_path = dir.join("location.conf");
        std::fs::write(&snippet_path, "location / {\n    allowed_methods GET;\n}\n").unwrap();

        let main_src = r#"
            http {
                server {
                    listen 8080;
                    root /var/www;
                    include location.conf;
                }
            }
        "#;

        let rule = parse_with_base(main_src, &dir).unwrap();
        assert_eq!(rule.servers[0].locations[0].prefix, "/");
        assert!(rule.servers[0].locations[0].allowed_methods.iter().any(|m| m.to_string() == "GET"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn include_of_missing_file_is_an_error() {
        let err = parse_with_base("http { include nope.conf; }", Path::new("/nonexistent/dir")).unwrap_err();
        assert!(err.message.contains("nope.conf"));
    }
}
