use tracing::{error, info};

use roomcast::config::Config;
use roomcast::{engine, PRODUCT, VERSION};

fn configure_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .init();
}

#[tokio::main]
async fn main() {
    configure_logging();
    info!("{PRODUCT} {VERSION}");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine::run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}
