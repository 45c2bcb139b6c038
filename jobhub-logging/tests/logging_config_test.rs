use jobhub_config::{LogFormat, LogLevel, LoggingConfig};
use jobhub_logging::{build_env_filter, init_logging_from_config, init_worker_tracing};

#[test]
fn test_env_filter_uses_configured_level() {
    let filter = build_env_filter("debug", &[]);
    assert_eq!(filter.to_string(), "debug");
}

#[test]
fn test_env_filter_appends_directives() {
    let filter = build_env_filter(
        "warn",
        &["jobhub_execution=trace".to_string(), "not a directive=".to_string()],
    );
    let rendered = filter.to_string();
    assert!(rendered.contains("warn"));
    assert!(rendered.contains("jobhub_execution=trace"));
}

#[test]
fn test_repeated_initialization_is_harmless() {
    let config = LoggingConfig {
        level: LogLevel::Debug,
        format: LogFormat::Json,
        directives: Vec::new(),
    };
    assert!(init_logging_from_config(&config).is_ok());
    assert!(init_logging_from_config(&LoggingConfig::default()).is_ok());
    assert!(init_worker_tracing(Some("trace")).is_ok());
}
