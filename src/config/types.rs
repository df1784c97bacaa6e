//! Configuration data model (spec §3 "Location rule" / "Server config" /
//! "HTTP rule"). The file grammar that produces these values lives in
//! `lexer.rs`/`parser.rs`; this module is pure data.

use std::collections::HashMap;
use std::time::Duration;

use crate::http::Method;

#[derive(Debug, Clone)]
pub struct LocationRule {
    pub prefix: String,
    pub allowed_methods: Vec<Method>,
    pub root: Option<String>,
    pub alias: Option<String>,
    pub index: Option<Vec<String>>,
    pub autoindex: bool,
    pub return_rule: Option<(u16, String)>,
    pub upload_store: Option<String>,
    pub error_pages: HashMap<u16, String>,
    pub max_body_size: usize,
    pub cgi: bool,
    pub cgi_extension: Vec<String>,
    pub cgi_timeout: Duration,
    pub client_body_timeout: Duration,
}

impl Default for LocationRule {
    fn default() -> Self {
        LocationRule {
            prefix: "/".to_string(),
            allowed_methods: vec![Method::Get],
            root: None,
            alias: None,
            index: None,
            autoindex: false,
            return_rule: None,
            upload_store: None,
            error_pages: HashMap::new(),
            max_body_size: 1024 * 1024,
            cgi: false,
            cgi_extension: Vec::new(),
            cgi_timeout: Duration::from_secs(30),
            client_body_timeout: Duration::from_secs(30),
        }
    }
}

impl LocationRule {
    pub fn is_cgi_target(&self, path: &str, is_directory: bool) -> bool {
        if self.cgi {
            return true;
        }
        if is_directory {
            return false;
        }
        self.cgi_extension.iter().any(|ext| path.ends_with(ext.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub server_name: Option<String>,
    pub is_default: bool,
    pub client_header_timeout: Duration,
    pub client_max_body_size: usize,
    pub locations: Vec<LocationRule>,
    pub default_location: LocationRule,
}

impl ServerConfig {
    pub fn all_locations(&self) -> Vec<&LocationRule> {
        let mut v: Vec<&LocationRule> = self.locations.iter().collect();
        v.push(&self.default_location);
        v
    }
}

#[derive(Debug, Clone)]
pub struct HttpRule {
    pub client_header_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub servers: Vec<ServerConfig>,
}

impl HttpRule {
    /// Servers bound to `port`, in declaration order.
    pub fn servers_on(&self, port: u16) -> Vec<&ServerConfig> {
        self.servers.iter().filter(|s| s.port == port).collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.servers.iter().map(|s| s.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// §4.8 "Request config resolution": match by `Host`, else the
    /// default-flagged server, else the first one declared on the port.
    pub fn resolve_server(&self, port: u16, host: Option<&str>) -> Option<&ServerConfig> {
        let candidates = self.servers_on(port);
        if let Some(host) = host {
            if let Some(found) = candidates.iter().find(|s| s.server_name.as_deref() == Some(host)) {
                return Some(found);
            }
        }
        candidates
            .iter()
            .find(|s| s.is_default)
            .copied()
            .or_else(|| candidates.first().copied())
    }
}
