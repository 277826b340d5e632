//! Integration tests for configuration files
//!
//! Covers loading from disk, search locations, partial documents and rejection of
//! invalid values.

use std::fs;
use tempfile::TempDir;
use usb_session::{OverflowPolicy, SessionConfig, TransferKind, load_config};

const FULL_CONFIG: &str = r#"
log_level = "debug"

[device]
vendor_id = "0x1733"
product_id = "0xAABB"
configuration = 2
interface = 1

[transfer]
in_endpoint = 0x82
out_endpoint = 0x02
packet_size = 512
poll_timeout_ms = 50
kind = "bulk"

[buffer]
capacity = 8192
overflow = "overwrite_oldest"

[session]
auto_start_reader = false
max_sessions = 4

[handshake]
enabled = true
open_command = 0x10
close_command = 0x11
timeout_ms = 250
"#;

#[test]
fn test_load_full_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = SessionConfig::load(Some(path)).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.device.vendor_id, 0x1733);
    assert_eq!(config.device.product_id, 0xAABB);
    assert_eq!(config.device.configuration, 2);
    assert_eq!(config.device.interface, 1);
    assert_eq!(config.transfer.in_endpoint, 0x82);
    assert_eq!(config.transfer.out_endpoint, 0x02);
    assert_eq!(config.transfer.packet_size, 512);
    assert_eq!(config.transfer.kind, TransferKind::Bulk);
    assert_eq!(config.buffer.capacity, 8192);
    assert_eq!(config.buffer.overflow, OverflowPolicy::OverwriteOldest);
    assert!(!config.session.auto_start_reader);
    assert_eq!(config.session.max_sessions, Some(4));
    assert_eq!(config.handshake.open_command, 0x10);
    assert_eq!(config.handshake.close_command, 0x11);
    assert_eq!(config.handshake_timeout().as_millis(), 250);
}

#[test]
fn test_empty_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.toml");
    fs::write(&path, "").unwrap();

    let config = SessionConfig::load(Some(path)).unwrap();
    assert_eq!(config.device.vendor_id, 0x1733);
    assert_eq!(config.transfer.poll_timeout_ms, 100);
    assert_eq!(config.buffer.capacity, 4096);
}

#[test]
fn test_load_config_from_path_string() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.toml");
    fs::write(
        &path,
        "[buffer]\ncapacity = 1024\n\n[session]\nmax_sessions = 2\n",
    )
    .unwrap();

    let loaded = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.buffer.capacity, 1024);
    assert_eq!(loaded.session.max_sessions, Some(2));
    assert_eq!(loaded.device.product_id, 0xAABB);
}

#[test]
fn test_search_paths_end_with_system_file() {
    let paths = SessionConfig::search_paths();
    assert_eq!(
        paths.last().unwrap(),
        std::path::Path::new("/etc/usb-session/session.toml")
    );
    assert!(paths.iter().all(|p| p.ends_with("usb-session/session.toml")));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = SessionConfig::load(Some(dir.path().join("absent.toml")));
    assert!(result.is_err());
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    let cases = [
        ("bad_level", "log_level = \"loud\""),
        ("in_endpoint", "[transfer]\nin_endpoint = 0x01"),
        ("out_endpoint", "[transfer]\nout_endpoint = 0x81"),
        ("timeout", "[transfer]\npoll_timeout_ms = 0"),
        ("capacity", "[buffer]\ncapacity = 0"),
        ("policy", "[buffer]\noverflow = \"sometimes\""),
        ("vid", "[device]\nvendor_id = \"1733\""),
        ("syntax", "[device\nvendor_id = 1"),
    ];

    for (name, content) in cases {
        let path = dir.path().join(format!("{}.toml", name));
        fs::write(&path, content).unwrap();
        assert!(
            SessionConfig::load(Some(path)).is_err(),
            "{} should be rejected",
            name
        );
    }
}
