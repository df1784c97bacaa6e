use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use webserv::config;
use webserv::server::Server;

fn start_server(config_src: &str, session_path: &str) {
    let http_rule = config::parse(config_src).expect("test config should parse");
    let session_path = std::path::PathBuf::from(session_path);
    thread::spawn(move || {
        let (mut server, signal_write) = Server::new(http_rule, session_path).expect("server should bind");
        std::mem::forget(signal_write);
        server.run().expect("server loop should not error");
    });
    thread::sleep(Duration::from_millis(200));
}

fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 8192];
    let n = stream.read(&mut buf).expect("response should arrive");
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[test]
fn serves_a_static_file_and_returns_404_for_missing_path() {
    let root = "./tmp_it_static";
    let _ = std::fs::remove_dir_all(root);
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(format!("{root}/index.html"), "hello from disk").unwrap();

    let conf = format!(
        r#"
        http {{
            server {{
                listen 18080;
                server_name localhost;
                location / {{
                    root {root};
                    index index.html;
                }}
            }}
        }}
        "#
    );
    start_server(&conf, "./tmp_it_static/sessions.sm");

    let mut stream = TcpStream::connect("127.0.0.1:18080").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("hello from disk"));

    let mut stream2 = TcpStream::connect("127.0.0.1:18080").unwrap();
    stream2.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream2
        .write_all(b"GET /missing.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response2 = read_response(&mut stream2);
    assert!(response2.starts_with("HTTP/1.1 404"), "got: {response2}");

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn lists_a_directory_when_autoindex_is_on() {
    let root = "./tmp_it_autoindex";
    let _ = std::fs::remove_dir_all(root);
    std::fs::create_dir_all(format!("{root}/sub")).unwrap();
    std::fs::write(format!("{root}/sub/a.txt"), "a").unwrap();

    let conf = format!(
        r#"
        http {{
            server {{
                listen 18081;
                server_name localhost;
                location / {{
                    root {root};
                    autoindex on;
                }}
            }}
        }}
        "#
    );
    start_server(&conf, "./tmp_it_autoindex/sessions.sm");

    let mut stream = TcpStream::connect("127.0.0.1:18081").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
        .write_all(b"GET /sub/ HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("a.txt"));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn keeps_the_connection_alive_across_pipelined_requests() {
    let root = "./tmp_it_pipeline";
    let _ = std::fs::remove_dir_all(root);
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(format!("{root}/index.html"), "pipelined").unwrap();

    let conf = format!(
        r#"
        http {{
            server {{
                listen 18082;
                server_name localhost;
                location / {{
                    root {root};
                    index index.html;
                }}
            }}
        }}
        "#
    );
    start_server(&conf, "./tmp_it_pipeline/sessions.sm");

    let mut stream = TcpStream::connect("127.0.0.1:18082").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let two_requests = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
                          GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    stream.write_all(two_requests).unwrap();

    let mut seen = String::new();
    while seen.matches("HTTP/1.1").count() < 2 {
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).expect("both responses should arrive");
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert_eq!(seen.matches("200").count(), 2, "got: {seen}");

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn redirects_via_a_return_rule() {
    let conf = r#"
        http {
            server {
                listen 18083;
                server_name localhost;
                location /old {
                    return 301 /new;
                }
            }
        }
        "#;
    start_server(conf, "./tmp_it_redirect_sessions.sm");

    let mut stream = TcpStream::connect("127.0.0.1:18083").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
        .write_all(b"GET /old HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 301"), "got: {response}");
    assert!(response.contains("Location: /new"));

    let _ = std::fs::remove_dir_all("./tmp_it_redirect_sessions.sm");
}
