//! Installs the process-wide subscriber, so it runs in its own test binary.

use courier_engine::dispatch::{DispatchConfig, LogFormat};
use courier_engine::logging::{init_tracing, init_tracing_for};

#[test]
fn only_the_first_install_wins() {
    let config = DispatchConfig {
        log_format: LogFormat::Json,
        ..DispatchConfig::default()
    };
    assert!(init_tracing_for(&config));
    assert!(tracing::dispatcher::has_been_set());

    assert!(!init_tracing(LogFormat::Pretty));
    assert!(!init_tracing_for(&DispatchConfig::default()));
    tracing::info!("still served by the first subscriber");
}
