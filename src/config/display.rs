//! Startup banner for a loaded configuration, in the teacher's colored
//! console-summary style — printed once right after a config parses clean.

use super::types::HttpRule;

pub fn print_summary(rule: &HttpRule) {
    println!("\x1b[1;36m=== webserv configuration ===\x1b[0m");
    for server in &rule.servers {
        let name = server.server_name.as_deref().unwrap_or("(any)");
        let default_tag = if server.is_default { " \x1b[33m[default]\x1b[0m" } else { "" };
        println!(
            "  \x1b[32mserver\x1b[0m :{} \x1b[1m{}\x1b[0m{}",
            server.port, name, default_tag
        );
        for loc in &server.locations {
            let methods: Vec<&str> = loc.allowed_methods.iter().map(|m| m.as_str()).collect();
            println!(
                "    \x1b[34mlocation\x1b[0m {} [{}]{}",
                loc.prefix,
                methods.join(","),
                if loc.cgi { " \x1b[35mcgi\x1b[0m" } else { "" }
            );
        }
    }
    println!(
        "\x1b[1;30mheader timeout\x1b[0m {:?}  \x1b[1;30mkeepalive\x1b[0m {:?}",
        rule.client_header_timeout, rule.keepalive_timeout
    );
}
