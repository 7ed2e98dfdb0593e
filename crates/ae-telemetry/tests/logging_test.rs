use ae_telemetry::logging::{self, LogFormat};

#[test]
fn init_logging_is_idempotent() {
    // Should not panic; second call is a safe no-op.
    logging::init_logging("test-service", "debug", LogFormat::Pretty);
    logging::init_logging("test-service", "info", LogFormat::Json);

    tracing::info!(task_id = "t-1", "log line after init");
}

#[test]
fn format_from_flag() {
    assert_eq!(LogFormat::from_json_flag(true), LogFormat::Json);
    assert_eq!(LogFormat::from_json_flag(false), LogFormat::Pretty);
    assert_eq!(LogFormat::default(), LogFormat::Pretty);
}
