//! Tests for error types

use campaign_etl::Error;

#[test]
fn test_schema_error() {
    let error = Error::schema("neurons", "Expected columns not present: [\"gid\"]");
    let error_str = format!("{error}");
    assert!(error_str.contains("Schema error in neurons"));
    assert!(error_str.contains("gid"));
}

#[test]
fn test_data_integrity_error() {
    let error = Error::DataIntegrity("neurons is empty".to_string());
    assert!(format!("{error}").contains("Data integrity error"));
}

#[test]
fn test_configuration_error_names_function() {
    let error = Error::function("psth", "must return named tables");
    let error_str = format!("{error}");
    assert!(error_str.contains("Configuration error"));
    assert!(error_str.contains("\"psth\""));
    assert!(error_str.contains("must return named tables"));
}

#[test]
fn test_precondition_error_points_to_extract_all() {
    let error = Error::Precondition("spikes has not been extracted".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Precondition failed"));
    assert!(error_str.contains("Repository::extract_all()"));
}

#[test]
fn test_read_only_cache_error() {
    let error = Error::ReadOnlyCache("windows".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Read-only cache"));
    assert!(error_str.contains("windows"));
}

#[test]
fn test_cache_invalid_error() {
    let error = Error::CacheInvalid("namespace mismatch".to_string());
    assert!(format!("{error}").contains("Invalid cache"));
}

#[test]
fn test_storage_error() {
    let error = Error::StorageError("file not found".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Storage error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_error_debug() {
    let error = Error::Precondition("x".to_string());
    let debug_str = format!("{error:?}");
    assert!(debug_str.contains("Precondition"));
}

#[test]
fn test_result_type_alias() {
    #[allow(clippy::unnecessary_wraps)]
    fn returns_result() -> campaign_etl::Result<i32> {
        Ok(42)
    }

    let result = returns_result();
    assert!(result.is_ok());
    assert_eq!(result.unwrap(), 42);
}

#[test]
fn test_result_type_alias_error() {
    fn returns_error() -> campaign_etl::Result<i32> {
        Err(Error::Configuration("test error".to_string()))
    }

    let result = returns_error();
    assert!(result.is_err());
}
