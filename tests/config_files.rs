//! Configuration ingest and startup validation.

use std::io::Write;

use lockstep::{ConfigError, SimConfig};

fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("lockstep-test-{}-{}", std::process::id(), name));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn test_loads_yaml_config() {
    let path = write_temp(
        "ok.yaml",
        "partition_count: 2\nsync_period: 4\nstop_at: 1000\n",
    );
    let config = SimConfig::load_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.partition_count, 2);
    assert_eq!(config.sync_period, Some(4));
    assert_eq!(config.stop_at, Some(1000));
    assert_eq!(config.vortex_capacity, None);
}

#[test]
fn test_loads_json_config() {
    let path = write_temp(
        "ok.json",
        r#"{"partition_count": 1, "vortex_capacity": 4096}"#,
    );
    let config = SimConfig::load_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.partition_count, 1);
    assert_eq!(config.vortex_capacity, Some(4096));
}

#[test]
fn test_rejects_unknown_extension() {
    let path = write_temp("bad.toml", "partition_count = 1\n");
    let err = SimConfig::load_file(&path).unwrap_err();
    std::fs::remove_file(&path).ok();

    assert!(matches!(err, ConfigError::UnknownFormat(ext) if ext == "toml"));
}

#[test]
fn test_rejects_partitioned_config_without_sync_period() {
    let path = write_temp("missing.yaml", "partition_count: 4\n");
    let err = SimConfig::load_file(&path).unwrap_err();
    std::fs::remove_file(&path).ok();

    assert!(matches!(err, ConfigError::MissingSyncPeriod));
}

#[test]
fn test_rejects_zero_partitions() {
    let path = write_temp("zero.yaml", "partition_count: 0\n");
    let err = SimConfig::load_file(&path).unwrap_err();
    std::fs::remove_file(&path).ok();

    assert!(matches!(err, ConfigError::BadPartitionCount(0)));
}
