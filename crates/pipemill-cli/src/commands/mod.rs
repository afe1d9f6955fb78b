pub mod scaffold;
pub mod start;
pub mod status;
pub mod submit;
pub mod worker;

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the long-running commands.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
