//! CGI sub-engine (spec §4.7): fork/exec a script, pump the request body into
//! its stdin and its stdout back out as the HTTP response body, all without
//! blocking the event loop.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use mio::net::TcpStream;

use crate::fd::FdState;
use crate::http::{BodyMode, Request};
use crate::iobuf::{find_subsequence, BodySource, BodyWriter, InBuffer, WriteOutcome};

use crate::http::response::ResponseEffect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    Unknown,
    FullBuffer(usize),
    Chunked,
}

pub struct CgiEnv(HashMap<String, String>);

impl CgiEnv {
    /// Builds the CGI/1.1 meta-variable set for `req`. `server_name`/`server_port`
    /// identify the bound virtual server; `script_filename`/`path_info` come
    /// from the location-prefix walk that located the script on disk.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        req: &Request,
        script_filename: &Path,
        script_name: &str,
        path_info: &str,
        server_name: &str,
        server_port: u16,
        server_addr: &str,
        remote_addr: &str,
        remote_port: u16,
        upload_store: Option<&str>,
        session_file: Option<&Path>,
    ) -> Self {
        let mut env = HashMap::new();
        env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
        env.insert("SERVER_PROTOCOL".into(), "HTTP/1.1".into());
        env.insert("SERVER_SOFTWARE".into(), "webserv/1.0".into());
        env.insert("REQUEST_METHOD".into(), req.method.to_string());
        env.insert("PATH_INFO".into(), path_info.to_string());
        env.insert("PATH_TRANSLATED".into(), script_filename.to_string_lossy().into_owned());
        env.insert("SCRIPT_FILENAME".into(), script_filename.to_string_lossy().into_owned());
        env.insert("SCRIPT_NAME".into(), script_name.to_string());
        env.insert("QUERY_STRING".into(), req.query.clone());
        env.insert("SERVER_NAME".into(), server_name.to_string());
        env.insert("SERVER_PORT".into(), server_port.to_string());
        env.insert("SERVER_ADDR".into(), server_addr.to_string());
        env.insert("REMOTE_ADDR".into(), remote_addr.to_string());
        env.insert("REMOTE_PORT".into(), remote_port.to_string());
        env.insert("REDIRECT_STATUS".into(), "200".into());

        if let Some(ct) = req.headers.get(crate::http::HeaderName::ContentType) {
            env.insert("CONTENT_TYPE".into(), ct.to_string());
        }
        if req.content_length > 0 {
            env.insert("CONTENT_LENGTH".into(), req.content_length.to_string());
        }
        if let Some(store) = upload_store {
            env.insert("WEBSERV_UPLOAD_STORE".into(), store.to_string());
        }
        if let Some(path) = session_file {
            env.insert("HTTP_SESSION_FILE".into(), path.to_string_lossy().into_owned());
        }

        for (k, v) in req.headers.iter() {
            let env_key = format!("HTTP_{}", k.to_uppercase().replace('-', "_"));
            env.insert(env_key, v.to_string());
        }

        CgiEnv(env)
    }
}

pub struct CgiResponse {
    pub client_token: mio::Token,
    pub close: bool,
    child: Child,
    started_at: Instant,

    stdin_pipe: Option<mio::net::UnixStream>,
    pending_stdin: Vec<u8>,
    body_mode: BodyMode,
    body_remaining: usize,
    socket_body_done: bool,

    stdout_pipe: mio::net::UnixStream,
    stdout_state: FdState,
    out_buf: InBuffer,

    header_parsed: bool,
    status: u16,
    headers: Vec<(String, String)>,
    extra_headers: Vec<(String, String)>,
    transfer_mode: TransferMode,
    header_bytes: Option<Vec<u8>>,
    sent_header: bool,
    body_written: usize,
    final_chunk_sent: bool,
    out_writer: BodyWriter,

    failed: Option<u16>,
}

impl CgiResponse {
    /// Spawns `interpreter_and_script` with `env`, wiring stdin/stdout to a
    /// pair of `UnixStream`s whose parent halves are returned non-blocking.
    pub fn start(
        client_token: mio::Token,
        script: &Path,
        env: CgiEnv,
        body_mode: BodyMode,
        content_length: usize,
        close: bool,
    ) -> io::Result<Self> {
        let (parent_stdin, child_stdin) = UnixStream::pair()?;
        let (child_stdout, parent_stdout) = UnixStream::pair()?;

        let cwd = script.parent().unwrap_or_else(|| Path::new("."));
        let mut cmd = Command::new(script);
        cmd.current_dir(cwd)
            .env_clear()
            .envs(env.0)
            .stdin(Stdio::from(OwnedFd::from(child_stdin.try_clone()?)))
            .stdout(Stdio::from(OwnedFd::from(child_stdout.try_clone()?)))
            .stderr(Stdio::null());

        let child = cmd.spawn()?;
        drop(child_stdin);
        drop(child_stdout);

        parent_stdin.set_nonblocking(true)?;
        parent_stdout.set_nonblocking(true)?;
        let parent_stdin = mio::net::UnixStream::from_std(parent_stdin);
        let parent_stdout = mio::net::UnixStream::from_std(parent_stdout);

        Ok(CgiResponse {
            client_token,
            close,
            child,
            started_at: Instant::now(),
            stdin_pipe: Some(parent_stdin),
            pending_stdin: Vec::new(),
            body_mode,
            body_remaining: content_length,
            socket_body_done: matches!(body_mode, BodyMode::NotSet),
            stdout_pipe: parent_stdout,
            stdout_state: FdState::Ready,
            out_buf: InBuffer::new(),
            header_parsed: false,
            status: 200,
            headers: Vec::new(),
            extra_headers: Vec::new(),
            transfer_mode: TransferMode::Unknown,
            header_bytes: None,
            sent_header: false,
            body_written: 0,
            final_chunk_sent: false,
            out_writer: BodyWriter::default(),
            failed: None,
        })
    }

    /// Queues an extra header for the eventual response, e.g. a fresh
    /// session's `Set-Cookie`, merged in alongside whatever the script emits.
    pub fn add_header(&mut self, key: String, value: String) {
        self.extra_headers.push((key, value));
    }

    pub fn stdin_pipe_mut(&mut self) -> Option<&mut mio::net::UnixStream> {
        self.stdin_pipe.as_mut()
    }

    pub fn stdout_pipe_mut(&mut self) -> &mut mio::net::UnixStream {
        &mut self.stdout_pipe
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Drains newly-arrived request-body bytes out of the client socket's
    /// buffer and queues them for the stdin pipe. Actual pipe writes happen
    /// lazily as the pipe reports writable (`on_stdin_writable`), but we
    /// opportunistically try here too so a single readable tick can finish
    /// small bodies without waiting on a second event.
    pub fn handle_request_body(&mut self, socket: &mut crate::fd::BufferedIo<TcpStream>) -> Vec<ResponseEffect> {
        if self.stdin_pipe.is_none() {
            socket.inbuf.extract_all();
            return vec![];
        }
        let chunk = match self.body_mode {
            BodyMode::Chunked => match socket.inbuf.extract_http_chunk(crate::iobuf::MAX_READ_BUFFER) {
                crate::iobuf::ChunkExtract::Chunk { data, .. } => data,
                crate::iobuf::ChunkExtract::Final => {
                    self.socket_body_done = true;
                    Vec::new()
                }
                crate::iobuf::ChunkExtract::NoChunk => Vec::new(),
            },
            BodyMode::ContentLength => {
                let take = socket.inbuf.len().min(self.body_remaining);
                let data = socket.inbuf.extract_n(take);
                self.body_remaining = self.body_remaining.saturating_sub(data.len());
                if self.body_remaining == 0 {
                    self.socket_body_done = true;
                }
                data
            }
            BodyMode::NotSet => {
                socket.inbuf.extract_all();
                Vec::new()
            }
        };
        if !chunk.is_empty() {
            self.pending_stdin.extend_from_slice(&chunk);
        }
        let _ = self.try_flush_stdin();
        vec![ResponseEffect::NeedsWritable]
    }

    /// Called when the stdin pipe (or the opportunistic path above) is ready
    /// to accept more bytes. Closes the pipe once the full body has arrived
    /// from the socket and nothing remains queued.
    pub fn try_flush_stdin(&mut self) -> io::Result<()> {
        let Some(pipe) = self.stdin_pipe.as_mut() else {
            return Ok(());
        };
        if !self.pending_stdin.is_empty() {
            match pipe.write(&self.pending_stdin) {
                Ok(n) => {
                    self.pending_stdin.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if self.socket_body_done && self.pending_stdin.is_empty() {
            self.stdin_pipe.take();
        }
        Ok(())
    }

    pub fn on_stdin_writable(&mut self) -> io::Result<()> {
        self.try_flush_stdin()
    }

    /// Reads whatever the script has written so far. When the pipe closes
    /// (or hits the buffer cap) and headers haven't been parsed yet, parses
    /// the CGI header block now.
    pub fn on_stdout_readable(&mut self) -> io::Result<()> {
        if self.stdout_state == FdState::Closed {
            return Ok(());
        }
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stdout_pipe.read(&mut chunk) {
                Ok(0) => {
                    self.stdout_state = FdState::Closed;
                    break;
                }
                Ok(n) => self.out_buf.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stdout_state = FdState::Closed;
                    return Err(e);
                }
            }
            if self.out_buf.is_backpressured() {
                break;
            }
        }
        if !self.header_parsed && (self.stdout_state == FdState::Closed || self.out_buf.is_backpressured()) {
            self.prepare_response();
        }
        Ok(())
    }

    fn prepare_response(&mut self) {
        let raw = self.out_buf.peek().to_vec();
        let Some(pos) = find_subsequence(&raw, b"\r\n\r\n", 0) else {
            if self.stdout_state == FdState::Closed {
                self.failed = Some(500);
                self.header_parsed = true;
            }
            return;
        };
        let header_section = String::from_utf8_lossy(&raw[..pos]).into_owned();
        self.out_buf.extract_n(pos + 4);

        if header_section.trim().is_empty() {
            self.failed = Some(500);
            self.header_parsed = true;
            return;
        }

        let mut status = 200u16;
        let mut headers = Vec::new();
        for line in header_section.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            let (k, v) = (k.trim(), v.trim());
            if k.eq_ignore_ascii_case("status") {
                let code: u16 = v.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
                status = if (100..=599).contains(&code) { code } else { 200 };
            } else {
                headers.push((k.to_string(), v.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok());
        let is_chunked_hdr = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));

        self.transfer_mode = match (content_length, is_chunked_hdr) {
            (Some(len), false) => TransferMode::FullBuffer(len),
            _ => {
                headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
                headers.retain(|(k, _)| !k.eq_ignore_ascii_case("transfer-encoding"));
                headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
                TransferMode::Chunked
            }
        };

        self.status = status;
        self.headers = headers;
        self.header_parsed = true;
    }

    pub fn handle_socket_write_tick(&mut self, socket: &mut TcpStream) -> io::Result<Vec<ResponseEffect>> {
        if let Some(code) = self.failed {
            self.status = code;
            self.headers.clear();
            self.transfer_mode = TransferMode::FullBuffer(0);
        }
        if self.transfer_mode == TransferMode::Unknown {
            return Ok(vec![]);
        }
        if !self.sent_header {
            if self.header_bytes.is_none() {
                self.header_bytes = Some(self.build_header_bytes());
            }
            let bytes = self.header_bytes.clone().unwrap();
            match socket.write(&bytes) {
                Ok(n) if n == bytes.len() => self.sent_header = true,
                Ok(n) => self.header_bytes = Some(bytes[n..].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            return Ok(vec![]);
        }

        match self.transfer_mode {
            TransferMode::Chunked => {
                let bytes = self.out_buf.extract_all();
                let mut slice: &[u8] = &bytes;
                let mut src = BodySource::Bytes(&mut slice);
                let outcome = self.out_writer.send_body_as_http_chunk(&mut src, socket)?;
                if !slice.is_empty() {
                    self.out_buf.extend(slice);
                }
                if self.stdout_state == FdState::Closed
                    && self.out_buf.is_empty()
                    && self.out_writer.is_empty()
                    && !self.final_chunk_sent
                    && matches!(outcome, WriteOutcome::Drained)
                {
                    socket.write_all(b"0\r\n\r\n")?;
                    self.final_chunk_sent = true;
                }
            }
            TransferMode::FullBuffer(declared) => {
                let bytes = self.out_buf.extract_all();
                let mut slice: &[u8] = &bytes;
                let mut src = BodySource::Bytes(&mut slice);
                let before = slice.len();
                self.out_writer.send_body_as_string(&mut src, socket)?;
                self.body_written += before - slice.len();
                if !slice.is_empty() {
                    self.out_buf.extend(slice);
                }
                if self.body_written >= declared {
                    self.final_chunk_sent = true;
                }
            }
            TransferMode::Unknown => unreachable!(),
        }
        Ok(vec![])
    }

    fn build_header_bytes(&self) -> Vec<u8> {
        let text = if self.failed.is_some() { "Internal Server Error" } else { "CGI" };
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, text).into_bytes();
        for (k, v) in self.headers.iter().chain(self.extra_headers.iter()) {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        if self.close {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        if let TransferMode::FullBuffer(len) = self.transfer_mode {
            out.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    pub fn is_full_response_sent(&self) -> bool {
        self.header_parsed && self.sent_header && self.final_chunk_sent
    }

    pub fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.stdin_pipe.take();
    }

    pub fn should_directly_send_response(&self) -> bool {
        false
    }

    pub fn timed_out(&self, limit: std::time::Duration) -> bool {
        self.started_at.elapsed() > limit
    }

    /// Forces a gateway-timeout style close: if headers were never sent we
    /// can still downgrade cleanly to a 504; otherwise we just stop the
    /// chunked stream with a terminator the client can detect as truncated.
    pub fn force_timeout(&mut self) {
        self.terminate();
        if !self.sent_header {
            self.failed = Some(504);
            self.header_parsed = true;
            self.transfer_mode = TransferMode::FullBuffer(0);
            self.header_bytes = None;
        } else {
            self.final_chunk_sent = true;
        }
    }
}
