use webserv::config;

const FULL_CONFIG: &str = r#"
http {
    client_header_timeout 5s;
    keepalive_timeout 30s;

    server {
        listen 8080 default;
        server_name web1.test;
        client_max_body_size 2m;

        location / {
            root ./www;
            index index.html;
        }

        location /api {
            allowed_methods GET POST;
            root ./www/api;
            client_max_body_size 64k;
        }

        location /cgi-bin {
            root ./www/cgi-bin;
            cgi on;
            cgi_extension .py .sh;
            cgi_timeout 10s;
        }

        location /old {
            return 301 /new;
        }
    }

    server {
        listen 9090;
        server_name web2.test;

        location / {
            root ./web2/www;
            autoindex on;
        }
    }
}
"#;

#[test]
fn parses_a_multi_server_config() {
    let rule = config::parse(FULL_CONFIG).expect("valid config should parse");
    assert_eq!(rule.servers.len(), 2);
    assert_eq!(rule.ports(), vec![8080, 9090]);

    let web1 = rule.resolve_server(8080, Some("web1.test")).unwrap();
    assert!(web1.is_default);
    assert_eq!(web1.locations.len(), 4);

    let api = web1.locations.iter().find(|l| l.prefix == "/api").unwrap();
    assert_eq!(api.max_body_size, 64 * 1024);

    let cgi = web1.locations.iter().find(|l| l.prefix == "/cgi-bin").unwrap();
    assert!(cgi.cgi);
    assert_eq!(cgi.cgi_extension, vec![".py".to_string(), ".sh".to_string()]);

    let old = web1.locations.iter().find(|l| l.prefix == "/old").unwrap();
    assert_eq!(old.return_rule, Some((301, "/new".to_string())));
}

#[test]
fn falls_back_to_default_flagged_server_on_unknown_host() {
    let rule = config::parse(FULL_CONFIG).unwrap();
    let resolved = rule.resolve_server(8080, Some("nonexistent.test")).unwrap();
    assert_eq!(resolved.server_name.as_deref(), Some("web1.test"));
}

#[test]
fn falls_back_to_first_declared_server_without_default_flag() {
    let rule = config::parse(FULL_CONFIG).unwrap();
    let resolved = rule.resolve_server(9090, Some("unused.test")).unwrap();
    assert_eq!(resolved.server_name.as_deref(), Some("web2.test"));
}

#[test]
fn missing_http_block_is_rejected() {
    let err = config::parse("server { listen 80; }").unwrap_err();
    assert!(err.message.to_lowercase().contains("http"));
}

#[test]
fn define_substitution_resolves_before_use() {
    let src = r#"
http {
    define $docroot ./www;
    server {
        listen 8080;
        location / {
            root $docroot;
        }
    }
}
"#;
    let rule = config::parse(src).unwrap();
    let loc = &rule.servers[0].locations[0];
    assert_eq!(loc.root.as_deref(), Some("./www"));
}
