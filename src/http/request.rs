//! HTTP framing (spec §4.3 / §3 "Request"): request-line parsing, the header
//! multimap, URL decoding, and chunked/content-length body-mode derivation.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
    Put,
    Head,
    Options,
    Unknown(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Put => "PUT",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Unknown(s) => s,
        }
    }

    pub fn is_allowed(&self, allowed: &[Method]) -> bool {
        allowed.contains(self)
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "DELETE" => Method::Delete,
            "PUT" => Method::Put,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            other => Method::Unknown(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderName {
    ContentType,
    ContentLength,
    Host,
    TransferEncoding,
    Connection,
    Cookie,
    SetCookie,
    Location,
    Date,
    RetryAfter,
    CacheControl,
    Status,
}

impl HeaderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderName::ContentType => "Content-Type",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::Host => "Host",
            HeaderName::TransferEncoding => "Transfer-Encoding",
            HeaderName::Connection => "Connection",
            HeaderName::Cookie => "Cookie",
            HeaderName::SetCookie => "Set-Cookie",
            HeaderName::Location => "Location",
            HeaderName::Date => "Date",
            HeaderName::RetryAfter => "Retry-After",
            HeaderName::CacheControl => "Cache-Control",
            HeaderName::Status => "Status",
        }
    }
}

/// A case-sensitive-storage, case-insensitive-lookup multimap. Repeated keys
/// (e.g. `Set-Cookie`) retain every value in insertion order; a single lookup
/// returns the first match.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    pub fn get(&self, name: HeaderName) -> Option<&str> {
        self.get_by_str(name.as_str())
    }

    pub fn get_by_str(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: HeaderName) -> impl Iterator<Item = &str> {
        let key = name.as_str();
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    NotSet,
    Chunked,
    ContentLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Incomplete,
    MalformedRequestLine,
    InvalidVersion,
    MissingHost,
    HeaderTooLong,
    MalformedHeader,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "incomplete request"),
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::InvalidVersion => write!(f, "unsupported HTTP version"),
            ParseError::MissingHost => write!(f, "missing Host header"),
            ParseError::HeaderTooLong => write!(f, "header line too long"),
            ParseError::MalformedHeader => write!(f, "malformed header line"),
        }
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub raw_url: String,
    pub path: String,
    pub query: String,
    pub version: String,
    pub resolved_path: Option<std::path::PathBuf>,
    pub is_directory: bool,
    pub headers: HeaderMap,
    pub content_length: usize,
    pub header_len: usize,
    pub cookies: Vec<(String, String)>,
    pub session_id: Option<String>,
    pub receiving_body_mode: BodyMode,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Request {
            method: Method::Get,
            raw_url: String::new(),
            path: String::new(),
            query: String::new(),
            version: String::new(),
            resolved_path: None,
            is_directory: false,
            headers: HeaderMap::new(),
            content_length: 0,
            header_len: 0,
            cookies: Vec::new(),
            session_id: None,
            receiving_body_mode: BodyMode::NotSet,
        }
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(HeaderName::Host).map(|h| h.split(':').next().unwrap_or(h))
    }

    pub fn connection_close(&self) -> bool {
        self.headers
            .get(HeaderName::Connection)
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }

    /// Parses the full header block (`head` excludes the trailing CRLFCRLF,
    /// as returned by `InBuffer::extract_headers`). Derives `content_length`,
    /// `receiving_body_mode` (chunked takes priority per spec), and cookies.
    pub fn parse_head(head: &[u8]) -> Result<Request, ParseError> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::MalformedRequestLine)?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ParseError::MalformedRequestLine);
        }
        if !parts[2].starts_with("HTTP/") {
            return Err(ParseError::InvalidVersion);
        }

        let mut req = Request::new();
        req.method = parts[0].parse().unwrap();
        req.raw_url = parts[1].to_string();
        req.version = parts[2].to_string();
        req.header_len = head.len() + 4;

        let decoded = url_decode(&req.raw_url);
        match decoded.split_once('?') {
            Some((p, q)) => {
                req.path = p.to_string();
                req.query = q.to_string();
            }
            None => req.path = decoded,
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (k, v) = line.split_once(':').ok_or(ParseError::MalformedHeader)?;
            req.headers.insert(k.trim().to_string(), v.trim().to_string());
        }

        if req.headers.get(HeaderName::Host).is_none() {
            return Err(ParseError::MissingHost);
        }

        if let Some(cookie_header) = req.headers.get(HeaderName::Cookie) {
            req.cookies = parse_cookie_header(cookie_header);
        }

        req.receiving_body_mode = if req
            .headers
            .get(HeaderName::TransferEncoding)
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            BodyMode::Chunked
        } else if let Some(len) = req.headers.get(HeaderName::ContentLength) {
            req.content_length = len.trim().parse().unwrap_or(0);
            if req.content_length > 0 {
                BodyMode::ContentLength
            } else {
                BodyMode::NotSet
            }
        } else {
            BodyMode::NotSet
        };

        Ok(req)
    }
}

pub fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|part| {
            let part = part.trim();
            part.split_once('=').map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Decodes `%HH` hex escapes and `+` → space, per the standard form/URL
/// decoding rule. Invalid escapes pass through byte-for-byte.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let req = Request::parse_head(b"GET /index.html HTTP/1.1\r\nHost: x\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.host(), Some("x"));
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = Request::parse_head(b"GET / HTTP/1.1\r\n").unwrap_err();
        assert_eq!(err, ParseError::MissingHost);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let req = Request::parse_head(
            b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n",
        )
        .unwrap();
        assert_eq!(req.receiving_body_mode, BodyMode::Chunked);
    }

    #[test]
    fn content_length_mode_when_no_chunking() {
        let req = Request::parse_head(b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n").unwrap();
        assert_eq!(req.receiving_body_mode, BodyMode::ContentLength);
        assert_eq!(req.content_length, 5);
    }

    #[test]
    fn url_decode_handles_percent_and_plus() {
        assert_eq!(url_decode("/a%20b+c"), "/a b c");
        assert_eq!(url_decode("/%2e%2e/"), "/../");
    }

    #[test]
    fn query_string_is_split_off_path() {
        let req = Request::parse_head(b"GET /a?x=1&y=2 HTTP/1.1\r\nHost: x\r\n").unwrap();
        assert_eq!(req.path, "/a");
        assert_eq!(req.query, "x=1&y=2");
    }

    #[test]
    fn cookies_are_parsed_from_header() {
        let req =
            Request::parse_head(b"GET / HTTP/1.1\r\nHost: x\r\nCookie: a=1; webservSessionId=abc\r\n")
                .unwrap();
        assert_eq!(req.cookies.len(), 2);
        assert_eq!(req.cookies[1], ("webservSessionId".to_string(), "abc".to_string()));
    }
}
