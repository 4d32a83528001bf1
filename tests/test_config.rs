use std::sync::Mutex;
use std::time::Duration;

use courier::config::Config;

// Environment variables are process-global; serialize the tests that touch
// them.
static TEST_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn test_config_defaults() {
    let _lock = TEST_LOCK.lock().unwrap();
    std::env::remove_var("LISTEN");
    std::env::remove_var("CONNECT_PASSWORD");

    let config = Config::default();
    assert_eq!(config.server.listen_addr, "127.0.0.1:4080");
    assert_eq!(config.server.connect_password, "");
    assert_eq!(config.connect_password_timeout(), Duration::from_secs(15));
    assert_eq!(config.header_timeout(), None);
    assert_eq!(config.checkout_timeout(), None);
    assert_eq!(config.buffers.temp_dir.to_str().unwrap(), "/tmp");
    assert_eq!(config.buffers.spill_watermark, 1024 * 1024);
    assert_eq!(config.buffers.max_header_size, 128 * 1024);
    assert!(config.workers.is_empty());
}

#[test]
fn test_config_env_overrides() {
    let _lock = TEST_LOCK.lock().unwrap();
    std::env::set_var("LISTEN", "0.0.0.0:9000");
    std::env::set_var("CONNECT_PASSWORD", "sesame");

    let config = Config::load().unwrap();
    assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
    assert_eq!(config.server.connect_password, "sesame");

    std::env::remove_var("LISTEN");
    std::env::remove_var("CONNECT_PASSWORD");
}

#[test]
fn test_config_from_yaml() {
    let _lock = TEST_LOCK.lock().unwrap();

    let yaml_content = r#"
server:
  listen_addr: "unix:/run/courier.sock"
  connect_password: "secret"
  connect_password_timeout_ms: 5000
  header_timeout_ms: 2000

buffers:
  temp_dir: "/var/tmp"
  spill_watermark: 65536

workers:
  - address: "tcp://127.0.0.1:4000"
    name: "app-1"
    connect_password: "handshake"
  - address: "unix:/run/app-2.sock"
    connect_password: "handshake2"
"#;

    let path = std::env::temp_dir().join(format!("courier-test-config-{}.yaml", std::process::id()));
    std::fs::write(&path, yaml_content).unwrap();
    let config = Config::load_from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.server.listen_addr, "unix:/run/courier.sock");
    assert_eq!(config.server.connect_password, "secret");
    assert_eq!(config.connect_password_timeout(), Duration::from_secs(5));
    assert_eq!(config.header_timeout(), Some(Duration::from_secs(2)));
    assert_eq!(config.buffers.temp_dir.to_str().unwrap(), "/var/tmp");
    assert_eq!(config.buffers.spill_watermark, 65536);
    // Unspecified fields keep their defaults.
    assert_eq!(config.buffers.max_header_size, 128 * 1024);

    assert_eq!(config.workers.len(), 2);
    assert_eq!(config.workers[0].address, "tcp://127.0.0.1:4000");
    assert_eq!(config.workers[0].name.as_deref(), Some("app-1"));
    assert_eq!(config.workers[1].name, None);
    assert_eq!(config.workers[1].connect_password, "handshake2");
}

#[test]
fn test_config_rejects_malformed_yaml() {
    let path = std::env::temp_dir().join(format!("courier-bad-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "server: [not, a, mapping").unwrap();
    let result = Config::load_from_file(&path);
    std::fs::remove_file(&path).unwrap();

    assert!(result.is_err());
}
