use std::error::Error;

use sniroute_config::Config;
use sniroute_core::run_proxy;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize logging and run the router until it terminates.
///
/// The dns, tcp and sni streams share the configured severity; everything
/// else stays at info.
pub async fn run(config: Config) -> Result<(), Box<dyn Error>> {
    let level = config.log_level;
    let filter = EnvFilter::try_new(format!("info,dns={level},tcp={level},sni={level}"))?;
    fmt().with_env_filter(filter).json().init();

    run_proxy(config).await
}
