use std::path::PathBuf;
use vanguard::config::Config;

#[test]
fn test_empty_config_uses_defaults() {
    let cfg = Config::from_yaml("{}").unwrap();

    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8081");
    assert_eq!(cfg.static_files.root, PathBuf::from("./dist"));
    assert!(cfg.proxy.is_empty());
}

#[test]
fn test_full_config() {
    let yaml = r#"
server:
  listen_addr: 0.0.0.0:3000
static_files:
  root: ./public
proxy:
  - prefix: /api
    target: http://localhost:8080
    rewrite_origin: true
    verify_tls: false
  - prefix: /ws
    target: http://localhost:9090
"#;

    let cfg = Config::from_yaml(yaml).unwrap();

    assert_eq!(cfg.server.listen_addr, "0.0.0.0:3000");
    assert_eq!(cfg.static_files.root, PathBuf::from("./public"));
    assert_eq!(cfg.proxy.len(), 2);

    assert_eq!(cfg.proxy[0].prefix, "/api");
    assert_eq!(cfg.proxy[0].target, "http://localhost:8080");
    assert!(cfg.proxy[0].rewrite_origin);
    assert!(!cfg.proxy[0].verify_tls);
}

#[test]
fn test_rule_flag_defaults() {
    let yaml = r#"
proxy:
  - prefix: /api
    target: http://localhost:8080
"#;

    let cfg = Config::from_yaml(yaml).unwrap();

    // Both behavioral flags default to on; rules opt out explicitly.
    assert!(cfg.proxy[0].rewrite_origin);
    assert!(cfg.proxy[0].verify_tls);
}

#[test]
fn test_rule_missing_target_is_rejected() {
    let yaml = r#"
proxy:
  - prefix: /api
"#;

    assert!(Config::from_yaml(yaml).is_err());
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "server:\n  listen_addr: 127.0.0.1:5000\n",
    )
    .unwrap();

    let cfg = Config::load(&path).unwrap();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:5000");
}

#[test]
fn test_load_missing_file_is_an_error() {
    let result = Config::load(std::path::Path::new("/nonexistent/config.yaml"));
    assert!(result.is_err());
}
