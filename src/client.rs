//! Client state machine (spec §4.6). Owns one accepted connection: its
//! socket, the request currently being parsed/served, and the variant-typed
//! response. Drives itself forward exactly one tick per poller event.

use std::path::PathBuf;
use std::time::Duration;

use mio::net::TcpStream;

use crate::cgi::{CgiEnv, CgiResponse};
use crate::config::{HttpRule, LocationRule, ServerConfig};
use crate::fd::{BufferedIo, FdState};
use crate::http::response::{make_error_response, FileResponse, ResponseEffect, ResponseKind, StaticResponse};
use crate::http::{cookie, BodyMode, Method, Request};
use crate::iobuf::ChunkStatus;
use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    WaitingForHeaders,
    ReadingBody,
    SendingResponse,
    Idle,
}

pub struct Client {
    pub socket: BufferedIo<TcpStream>,
    pub state: ClientState,
    pub request: Request,
    pub response: Option<ResponseKind>,
    pub location: Option<LocationRule>,
    pub peer_addr: String,
    pub peer_port: u16,
    pub listening_port: u16,
    pub body_bytes_total: usize,
    pub should_close: bool,
    pub disconnect: bool,
    new_session_cookie: Option<String>,
}

/// What `handle_read`/`handle_write` want the server to do — the client
/// never talks to the poller or timer directly.
#[derive(Debug, Default)]
pub struct ClientOutcome {
    pub needs_writable: bool,
    pub schedule_cgi_timeout: Option<(Duration, mio::Token)>,
    pub cancel_cgi_timeout: bool,
    pub disconnect: bool,
}

impl Client {
    pub fn new(stream: TcpStream, listening_port: u16) -> Self {
        let (peer_addr, peer_port) = match stream.peer_addr() {
            Ok(addr) => (addr.ip().to_string(), addr.port()),
            Err(_) => ("0.0.0.0".to_string(), 0),
        };
        Client {
            socket: BufferedIo::new(stream),
            state: ClientState::WaitingForHeaders,
            request: Request::new(),
            response: None,
            location: None,
            peer_addr,
            peer_port,
            listening_port,
            body_bytes_total: 0,
            should_close: false,
            disconnect: false,
            new_session_cookie: None,
        }
    }

    pub fn active_timeout(&self, http_rule: &HttpRule) -> Duration {
        let header_timeout = self
            .resolve_server(http_rule)
            .map(|s| s.client_header_timeout)
            .unwrap_or(http_rule.client_header_timeout);
        match self.state {
            ClientState::WaitingForHeaders => header_timeout,
            ClientState::ReadingBody => self
                .location
                .as_ref()
                .map(|l| l.client_body_timeout)
                .unwrap_or(header_timeout),
            ClientState::Idle => http_rule.keepalive_timeout,
            ClientState::SendingResponse => http_rule.keepalive_timeout,
        }
    }

    pub fn handle_read(&mut self, http_rule: &HttpRule, session_store: &mut crate::http::session::SessionStore) -> ClientOutcome {
        let mut outcome = ClientOutcome::default();
        match self.socket.read_tick() {
            Ok(0) if self.socket.state == FdState::Closed && self.socket.inbuf.is_empty() => {
                outcome.disconnect = true;
                return outcome;
            }
            Ok(_) => {}
            Err(_) => {
                outcome.disconnect = true;
                return outcome;
            }
        }

        loop {
            match self.state {
                ClientState::WaitingForHeaders => {
                    if !self.try_parse_headers(http_rule, session_store, &mut outcome) {
                        break;
                    }
                }
                ClientState::ReadingBody => {
                    if !self.progress_body(&mut outcome) {
                        break;
                    }
                }
                ClientState::Idle => {
                    if self.socket.inbuf.is_empty() {
                        break;
                    }
                    self.reset_for_next_request();
                    self.state = ClientState::WaitingForHeaders;
                }
                ClientState::SendingResponse => break,
            }
        }
        outcome
    }

    /// Returns `false` once there's nothing further to do this tick.
    fn try_parse_headers(
        &mut self,
        http_rule: &HttpRule,
        session_store: &mut crate::http::session::SessionStore,
        outcome: &mut ClientOutcome,
    ) -> bool {
        let Some(head) = self.socket.inbuf.extract_headers() else {
            if self.socket.inbuf.is_backpressured() {
                outcome.disconnect = true;
            }
            return false;
        };

        self.new_session_cookie = None;
        match Request::parse_head(&head) {
            Ok(mut req) => {
                let existing = cookie::find_session_cookie(&req.cookies).map(|s| s.to_string());
                match existing {
                    Some(id) if session_store.exists(&id) => {
                        session_store.touch(&id);
                        req.session_id = Some(id);
                    }
                    _ => {
                        let id = session_store.create();
                        req.session_id = Some(id.clone());
                        self.new_session_cookie = Some(id);
                    }
                }
                self.request = req;
            }
            Err(_) => {
                self.enter_error_response(400, true);
                outcome.needs_writable = true;
                return false;
            }
        }

        let server = self.resolve_server(http_rule);
        let location = server
            .and_then(|s| path::match_location(&s.locations, &self.request.path).or(Some(&s.default_location)))
            .cloned();
        self.location = location;

        self.build_response(session_store, outcome);
        if let Some(id) = self.new_session_cookie.clone() {
            if let Some(response) = &mut self.response {
                response.add_header(
                    "Set-Cookie",
                    &cookie::build_set_cookie(&id, crate::http::session::SESSION_MAX_AGE_SECS),
                );
            }
        }
        if self.request.connection_close() {
            self.should_close = true;
        }

        match self.request.receiving_body_mode {
            BodyMode::NotSet => {
                self.state = ClientState::SendingResponse;
            }
            _ => {
                self.state = ClientState::ReadingBody;
            }
        }
        if matches!(self.response, Some(ref r) if r.should_directly_send_response()) {
            outcome.needs_writable = true;
        }
        true
    }

    fn resolve_server<'a>(&self, http_rule: &'a HttpRule) -> Option<&'a ServerConfig> {
        http_rule.resolve_server(self.listening_port, self.request.host())
    }

    /// §4.6 "Binding decision order" inside `create_response_from_request`.
    fn build_response(
        &mut self,
        session_store: &mut crate::http::session::SessionStore,
        outcome: &mut ClientOutcome,
    ) {
        let Some(location) = self.location.clone() else {
            self.enter_error_response(404, true);
            return;
        };

        if self.request.content_length > location.max_body_size {
            self.enter_error_response(413, true);
            return;
        }

        let resolved = path::resolve(&self.request.path, &location);
        let (resolved_path, is_directory) = match &resolved {
            Ok(r) => (Some(r.path.clone()), r.is_directory),
            Err(_) => (None, false),
        };

        if location.is_cgi_target(&self.request.path, is_directory) {
            if let Some(path) = &resolved_path {
                self.start_cgi(path, &location, session_store, outcome);
                return;
            }
            self.enter_error_response(400, true);
            return;
        }

        if !self.request.method.is_allowed(&location.allowed_methods) {
            self.enter_error_response(405, true);
            return;
        }

        if let Some((code, target)) = &location.return_rule {
            let is_redirect = (300..400).contains(code);
            let headers = if is_redirect {
                vec![("Location".to_string(), target.clone())]
            } else {
                vec![]
            };
            let close = self.should_close;
            self.response = Some(ResponseKind::Static(StaticResponse::new(
                *code,
                target.clone().into_bytes(),
                headers,
                close,
                self.request.method == Method::Head,
            )));
            return;
        }

        if location.root.is_none() && location.alias.is_none() {
            self.enter_error_response(404, true);
            return;
        }

        let Ok(resolved) = resolved else {
            self.enter_error_response(400, true);
            return;
        };

        if resolved.is_directory {
            if !location.autoindex {
                self.enter_error_response(403, true);
                return;
            }
            let body = render_directory_listing(&resolved.path, &self.request.path);
            let close = self.should_close;
            self.response = Some(ResponseKind::Static(StaticResponse::new(
                200,
                body,
                vec![("Content-Type".to_string(), "text/html".to_string())],
                close,
                self.request.method == Method::Head,
            )));
            return;
        }

        if self.request.method != Method::Get && self.request.method != Method::Head {
            self.enter_error_response(400, true);
            return;
        }

        match std::fs::File::open(&resolved.path) {
            Ok(file) => {
                let close = self.should_close;
                self.response = Some(ResponseKind::File(FileResponse::new(
                    file,
                    vec![],
                    close,
                    self.request.method == Method::Head,
                )));
            }
            Err(_) => self.enter_error_response(404, true),
        }
    }

    fn start_cgi(
        &mut self,
        script_dir_candidate: &std::path::Path,
        location: &LocationRule,
        session_store: &mut crate::http::session::SessionStore,
        outcome: &mut ClientOutcome,
    ) {
        let Some((script, path_info)) = path::locate_cgi_script(script_dir_candidate, location.index.as_deref()) else {
            self.enter_error_response(404, true);
            return;
        };

        // RFC 3875: SCRIPT_NAME and PATH_INFO must partition the request path,
        // so PATH_INFO's suffix is trimmed off the end of it.
        let script_name = self
            .request
            .path
            .strip_suffix(path_info.as_str())
            .filter(|_| !path_info.is_empty())
            .unwrap_or(&self.request.path)
            .to_string();

        let session_file = self
            .request
            .session_id
            .as_deref()
            .map(|id| session_store.absolute_file_path(id));

        let env = CgiEnv::build(
            &self.request,
            &script,
            &script_name,
            &path_info,
            "webserv",
            self.listening_port,
            "0.0.0.0",
            &self.peer_addr,
            self.peer_port,
            location.upload_store.as_deref(),
            session_file.as_deref(),
        );

        let close = self.should_close;
        match CgiResponse::start(
            mio::Token(0),
            &script,
            env,
            self.request.receiving_body_mode,
            self.request.content_length,
            close,
        ) {
            Ok(cgi) => {
                self.response = Some(ResponseKind::Cgi(cgi));
                outcome.schedule_cgi_timeout = Some((location.cgi_timeout, mio::Token(0)));
            }
            Err(_) => self.enter_error_response(500, true),
        }
    }

    fn enter_error_response(&mut self, code: u16, close: bool) {
        self.should_close = self.should_close || close;
        if let Some(response) = &mut self.response {
            response.terminate();
        }
        let body_path = self
            .location
            .as_ref()
            .and_then(|l| l.error_pages.get(&code))
            .map(PathBuf::from);

        if let Some(path) = body_path {
            if let Ok(file) = std::fs::File::open(&path) {
                self.response = Some(ResponseKind::File(FileResponse::with_status(code, file, vec![], true, false)));
                self.state = ClientState::SendingResponse;
                return;
            }
        }
        self.response = Some(ResponseKind::Static(make_error_response(code, true)));
        self.state = ClientState::SendingResponse;
    }

    /// Consumes any freshly-arrived body bytes and decides whether the body
    /// is now fully received, per §4.6 "Full-body detection".
    fn progress_body(&mut self, outcome: &mut ClientOutcome) -> bool {
        let before = self.socket.inbuf.len();
        if let Some(response) = &mut self.response {
            let effects = response.handle_request_body(&mut self.socket);
            for effect in effects {
                if effect == ResponseEffect::NeedsWritable {
                    outcome.needs_writable = true;
                }
            }
        }
        let consumed = before.saturating_sub(self.socket.inbuf.len());
        self.body_bytes_total += consumed;

        let full = match self.request.receiving_body_mode {
            BodyMode::ContentLength => {
                self.body_bytes_total >= self.request.content_length
            }
            BodyMode::Chunked => {
                match self.socket.inbuf.chunk_status(crate::iobuf::MAX_READ_BUFFER) {
                    ChunkStatus::Complete => true,
                    ChunkStatus::Error => {
                        self.enter_error_response(400, true);
                        return false;
                    }
                    ChunkStatus::TooLarge => {
                        self.enter_error_response(413, true);
                        return false;
                    }
                    ChunkStatus::Ongoing => false,
                }
            }
            BodyMode::NotSet => true,
        };

        if self.body_bytes_total > self.current_max_body_size() {
            self.enter_error_response(413, true);
            return false;
        }

        if full {
            self.state = ClientState::SendingResponse;
            outcome.needs_writable = true;
            return false;
        }
        consumed > 0
    }

    fn current_max_body_size(&self) -> usize {
        self.location.as_ref().map(|l| l.max_body_size).unwrap_or(usize::MAX)
    }

    pub fn handle_write(&mut self) -> ClientOutcome {
        let mut outcome = ClientOutcome::default();
        let Some(response) = &mut self.response else {
            return outcome;
        };
        match response.handle_socket_write_tick(&mut self.socket.inner) {
            Ok(_) => {}
            Err(_) => {
                outcome.disconnect = true;
                return outcome;
            }
        }
        if response.is_full_response_sent() {
            outcome.cancel_cgi_timeout = true;
            let close = self.should_close || response.wants_close();
            response.terminate();
            self.response = None;
            if close {
                outcome.disconnect = true;
            } else {
                self.reset_for_next_request();
                self.state = ClientState::Idle;
            }
        }
        outcome
    }

    fn reset_for_next_request(&mut self) {
        self.request = Request::new();
        self.response = None;
        self.location = None;
        self.body_bytes_total = 0;
        self.should_close = false;
        self.new_session_cookie = None;
    }
}

fn render_directory_listing(dir: &std::path::Path, url_path: &str) -> Vec<u8> {
    let mut entries = Vec::new();
    if let Ok(read_dir) = std::fs::read_dir(dir) {
        for entry in read_dir.flatten() {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    entries.sort();
    let mut body = format!("<html><head><title>Index of {url_path}</title></head><body><h1>Index of {url_path}</h1><ul>");
    for name in entries {
        body.push_str(&format!("<li><a href=\"{name}\">{name}</a></li>"));
    }
    body.push_str("</ul></body></html>");
    body.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn connected_pair() -> (TcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_side = StdTcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server_side), client_side)
    }

    #[test]
    fn new_client_starts_waiting_for_headers() {
        let (server_side, _client) = connected_pair();
        let client = Client::new(server_side, 8080);
        assert_eq!(client.state, ClientState::WaitingForHeaders);
    }

    #[test]
    fn current_max_body_size_defaults_without_location() {
        let (server_side, _client) = connected_pair();
        let client = Client::new(server_side, 8080);
        assert_eq!(client.current_max_body_size(), usize::MAX);
    }
}
