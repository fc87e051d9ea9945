pub mod builders;
pub mod fake_executor;
pub mod fake_launcher;
pub mod images;

use std::sync::Once;

use stevedore::logging::{LOG_ENV_VAR, default_filter, filter_from_env_value};
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Install a per-test subscriber once per test binary.
///
/// Output is captured by the harness and shown for failing tests only.
/// `STEVEDORE_LOG` takes the same values as the CLI (`debug`, or a full
/// directive such as `stevedore::store=trace`). Without it, stevedore logs
/// at `info` and other crates at `warn`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var(LOG_ENV_VAR)
            .ok()
            .and_then(|value| filter_from_env_value(&value).ok())
            .unwrap_or_else(|| EnvFilter::new(default_filter(Level::INFO)));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Upper bound for any single awaited step in a test.
pub const TEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Await `f`, panicking if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(value) => value,
        Err(_) => panic!("test step did not finish within {TEST_TIMEOUT:?}"),
    }
}
