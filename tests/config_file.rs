use std::io::Write;

use myriad::{ConfigError, Runtime, RuntimeConfig};
use tempfile::{tempdir, NamedTempFile};

#[test]
fn config_loads_from_file_with_defaults_filled_in() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "device": {{ "name": "bench-gpu", "capacity_bytes": 1048576 }},
            "simulation": {{ "simulation_length": 200 }}
        }}"#
    )
    .unwrap();

    let config = RuntimeConfig::from_path(file.path()).unwrap();
    assert_eq!(config.device.name, "bench-gpu");
    assert_eq!(config.device.capacity_bytes, 1_048_576);
    assert_eq!(config.device.alignment, 16);
    assert_eq!(config.simulation.simulation_length, 200);
    assert!((config.simulation.dt - 0.001).abs() < f64::EPSILON);

    let runtime = Runtime::with_simulated_device(config).unwrap();
    assert!(runtime.has_device());
    assert_eq!(runtime.stream().unwrap().queue_capacity(), 64);
}

#[test]
fn serialized_config_reads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("myriad.json");
    let mut config = RuntimeConfig::default();
    config.simulation.dt = 0.025;
    config.device.stream_queue_capacity = 8;
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    assert_eq!(RuntimeConfig::from_path(&path).unwrap(), config);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempdir().unwrap();
    let err = RuntimeConfig::from_path(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.json"));
}

#[test]
fn invalid_documents_are_rejected() {
    let err = RuntimeConfig::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));

    let err = RuntimeConfig::from_json_str(r#"{ "device": { "alignment": 12 } }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));

    let err =
        RuntimeConfig::from_json_str(r#"{ "simulation": { "simulation_length": 1 } }"#).unwrap_err();
    assert!(err.to_string().contains("simulation_length"));
}
