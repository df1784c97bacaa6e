//! Response variants (spec §4.5): a tagged union over {Static, File, CGI}
//! driven by a uniform tick protocol, replacing the virtual-dispatch
//! inheritance hierarchy the original design used. The client owns a
//! `Response` by value, so no reference cycles are possible.

use std::fs::File;
use std::io::{self, Write};
use std::time::Duration;

use mio::net::TcpStream;

use crate::cgi::CgiResponse;
use crate::fd::{BufferedIo, FdState};
use crate::iobuf::{BodySource, BodyWriter, WriteOutcome};
use crate::timer::TimerCallback;

/// What a tick wants the owning `Client`/`Server` to do on its behalf —
/// returned instead of holding a back-reference to the server, per the
/// CGI/File-to-Server redesign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseEffect {
    NeedsWritable,
    ScheduleTimer(Duration, mio::Token),
    CancelTimer,
}

pub type ResponseTick = io::Result<Vec<ResponseEffect>>;

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Civil calendar date from a day count since the epoch (proleptic
/// Gregorian, Howard Hinnant's `civil_from_days`). Returns `(year, month, day)`.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// RFC-1123 UTC timestamp for the `Date` header.
fn rfc1123_now() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = (secs / 86400) as i64;
    let day_secs = secs % 86400;
    let (h, m, s) = (day_secs / 3600, (day_secs % 3600) / 60, day_secs % 60);
    const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] =
        ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];
    let wd = WEEKDAYS[(days.rem_euclid(7)) as usize];
    let (year, month, day) = civil_from_days(days);
    let month_name = MONTHS[(month - 1) as usize];
    format!("{wd}, {day:02} {month_name} {year} {h:02}:{m:02}:{s:02} GMT")
}

fn common_headers(extra_close: bool) -> Vec<(String, String)> {
    let mut h = vec![
        ("Date".to_string(), rfc1123_now()),
        ("Cache-Control".to_string(), "no-cache, no-store, must-revalidate".to_string()),
        ("Retry-After".to_string(), "0".to_string()),
    ];
    if extra_close {
        h.push(("Connection".to_string(), "close".to_string()));
    }
    h
}

fn build_status_line(code: u16) -> String {
    format!("HTTP/1.1 {} {}\r\n", code, status_text(code))
}

fn build_header_block(code: u16, headers: &[(String, String)], close: bool) -> Vec<u8> {
    let mut out = build_status_line(code).into_bytes();
    for (k, v) in headers.iter().chain(common_headers(close).iter()) {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub struct StaticResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub close: bool,
    pub is_head: bool,
    header_bytes: Option<Vec<u8>>,
    sent_header: bool,
    body_sent: usize,
    writer: BodyWriter,
}

impl StaticResponse {
    pub fn new(status: u16, body: Vec<u8>, mut headers: Vec<(String, String)>, close: bool, is_head: bool) -> Self {
        let len = if is_head { 0 } else { body.len() };
        headers.push(("Content-Length".to_string(), len.to_string()));
        StaticResponse {
            status,
            headers,
            body,
            close,
            is_head,
            header_bytes: None,
            sent_header: false,
            body_sent: 0,
            writer: BodyWriter::default(),
        }
    }

    fn ensure_header_bytes(&mut self) {
        if self.header_bytes.is_none() {
            self.header_bytes = Some(build_header_block(self.status, &self.headers, self.close));
        }
    }

    pub fn handle_request_body(&mut self, socket: &mut BufferedIo<TcpStream>) {
        socket.inbuf.extract_all();
    }

    pub fn handle_socket_write_tick(&mut self, socket: &mut TcpStream) -> ResponseTick {
        self.ensure_header_bytes();
        if !self.sent_header {
            let bytes = self.header_bytes.clone().unwrap();
            match socket.write(&bytes) {
                Ok(n) if n == bytes.len() => self.sent_header = true,
                Ok(n) => {
                    self.header_bytes = Some(bytes[n..].to_vec());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            return Ok(vec![]);
        }
        if self.is_head || self.body_sent >= self.body.len() {
            return Ok(vec![]);
        }
        let mut remaining = &self.body[self.body_sent..];
        let mut src = BodySource::Bytes(&mut remaining);
        match self.writer.send_body_as_string(&mut src, socket)? {
            WriteOutcome::Drained | WriteOutcome::Partial => {
                let consumed = self.body.len() - self.body_sent - remaining.len();
                self.body_sent += consumed;
            }
            WriteOutcome::WouldBlock => {}
        }
        Ok(vec![])
    }

    pub fn is_full_response_sent(&self) -> bool {
        self.sent_header && (self.is_head || self.body_sent >= self.body.len()) && self.writer.is_empty()
    }

    pub fn terminate(&mut self) {}

    pub fn should_directly_send_response(&self) -> bool {
        true
    }
}

pub struct FileResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub close: bool,
    pub is_head: bool,
    file: BufferedIo<File>,
    sent_header: bool,
    header_bytes: Option<Vec<u8>>,
    writer: BodyWriter,
    final_chunk_sent: bool,
}

impl FileResponse {
    pub fn new(file: File, headers: Vec<(String, String)>, close: bool, is_head: bool) -> Self {
        Self::with_status(200, file, headers, close, is_head)
    }

    pub fn with_status(status: u16, file: File, mut headers: Vec<(String, String)>, close: bool, is_head: bool) -> Self {
        headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        FileResponse {
            status,
            headers,
            close,
            is_head,
            file: BufferedIo::new(file),
            sent_header: false,
            header_bytes: None,
            writer: BodyWriter::default(),
            final_chunk_sent: false,
        }
    }

    pub fn handle_request_body(&mut self, socket: &mut BufferedIo<TcpStream>) {
        socket.inbuf.extract_all();
    }

    pub fn handle_socket_write_tick(&mut self, socket: &mut TcpStream) -> ResponseTick {
        if self.header_bytes.is_none() {
            self.header_bytes = Some(build_header_block(self.status, &self.headers, self.close));
        }
        if !self.sent_header {
            let bytes = self.header_bytes.clone().unwrap();
            match socket.write(&bytes) {
                Ok(n) if n == bytes.len() => self.sent_header = true,
                Ok(n) => self.header_bytes = Some(bytes[n..].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            return Ok(vec![]);
        }
        if self.is_head {
            self.final_chunk_sent = true;
            return Ok(vec![]);
        }
        if self.file.state != FdState::Closed {
            let _ = self.file.read_tick()?;
        }
        if self.file.state == FdState::Closed && self.file.inbuf.is_empty() && self.writer.is_empty() {
            if !self.final_chunk_sent {
                socket.write_all(b"0\r\n\r\n")?;
                self.final_chunk_sent = true;
            }
            return Ok(vec![]);
        }
        let bytes = self.file.inbuf.extract_all();
        let mut slice: &[u8] = &bytes;
        let mut src = BodySource::Bytes(&mut slice);
        self.writer.send_body_as_http_chunk(&mut src, socket)?;
        if !slice.is_empty() {
            self.file.inbuf.extend(slice);
        }
        Ok(vec![])
    }

    pub fn is_full_response_sent(&self) -> bool {
        self.sent_header && self.final_chunk_sent
    }

    pub fn terminate(&mut self) {}

    pub fn should_directly_send_response(&self) -> bool {
        true
    }
}

pub enum ResponseKind {
    Static(StaticResponse),
    File(FileResponse),
    Cgi(CgiResponse),
}

impl ResponseKind {
    pub fn handle_request_body(&mut self, socket: &mut BufferedIo<TcpStream>) -> Vec<ResponseEffect> {
        match self {
            ResponseKind::Static(r) => {
                r.handle_request_body(socket);
                vec![]
            }
            ResponseKind::File(r) => {
                r.handle_request_body(socket);
                vec![]
            }
            ResponseKind::Cgi(r) => r.handle_request_body(socket),
        }
    }

    pub fn handle_socket_write_tick(&mut self, socket: &mut TcpStream) -> ResponseTick {
        match self {
            ResponseKind::Static(r) => r.handle_socket_write_tick(socket),
            ResponseKind::File(r) => r.handle_socket_write_tick(socket),
            ResponseKind::Cgi(r) => r.handle_socket_write_tick(socket),
        }
    }

    pub fn is_full_response_sent(&self) -> bool {
        match self {
            ResponseKind::Static(r) => r.is_full_response_sent(),
            ResponseKind::File(r) => r.is_full_response_sent(),
            ResponseKind::Cgi(r) => r.is_full_response_sent(),
        }
    }

    pub fn terminate(&mut self) {
        match self {
            ResponseKind::Static(r) => r.terminate(),
            ResponseKind::File(r) => r.terminate(),
            ResponseKind::Cgi(r) => r.terminate(),
        }
    }

    pub fn should_directly_send_response(&self) -> bool {
        match self {
            ResponseKind::Static(r) => r.should_directly_send_response(),
            ResponseKind::File(r) => r.should_directly_send_response(),
            ResponseKind::Cgi(r) => r.should_directly_send_response(),
        }
    }

    pub fn wants_close(&self) -> bool {
        match self {
            ResponseKind::Static(r) => r.close,
            ResponseKind::File(r) => r.close,
            ResponseKind::Cgi(r) => r.close,
        }
    }

    pub fn timer_tag(&self) -> Option<TimerCallback> {
        match self {
            ResponseKind::Cgi(r) => Some(TimerCallback::CgiTimeout(r.client_token)),
            _ => None,
        }
    }

    /// Appends a header to the not-yet-sent response, used to attach a fresh
    /// session's `Set-Cookie` after the response variant is already chosen.
    pub fn add_header(&mut self, key: &str, value: &str) {
        match self {
            ResponseKind::Static(r) => r.headers.push((key.to_string(), value.to_string())),
            ResponseKind::File(r) => r.headers.push((key.to_string(), value.to_string())),
            ResponseKind::Cgi(r) => r.add_header(key.to_string(), value.to_string()),
        }
    }
}

pub fn error_body(code: u16) -> Vec<u8> {
    format!(
        "<html><head><title>{code} {text}</title></head><body><center><h1>{code} {text}</h1></center></body></html>",
        code = code,
        text = status_text(code)
    )
    .into_bytes()
}

pub fn make_error_response(code: u16, close: bool) -> StaticResponse {
    let body = error_body(code);
    StaticResponse::new(code, body, vec![("Content-Type".to_string(), "text/html".to_string())], close, false)
}

/// Alias kept for call sites that only need the trait-protocol surface.
pub type Response = ResponseKind;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_response_marks_head_with_zero_length() {
        let resp = StaticResponse::new(200, b"hello".to_vec(), vec![], false, true);
        assert_eq!(resp.headers.last().unwrap().1, "0");
    }

    #[test]
    fn error_body_contains_status_text() {
        let body = String::from_utf8(error_body(404)).unwrap();
        assert!(body.contains("404"));
        assert!(body.contains("Not Found"));
    }

    #[test]
    fn make_error_response_has_content_length() {
        let resp = make_error_response(500, true);
        assert!(resp.headers.iter().any(|(k, _)| k == "Content-Length"));
        assert!(resp.close);
    }
}
