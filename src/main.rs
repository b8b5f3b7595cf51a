use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flightdeck")]
#[command(about = "Proxy that merges concurrent identical upstream requests", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "flightdeck.config.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing subscriber
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Layer in tokio-console when TOKIO_CONSOLE is set
    if std::env::var("TOKIO_CONSOLE").is_ok() {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_target(true);

        tracing_subscriber::registry()
            .with(console_subscriber::spawn())
            .with(fmt_layer)
            .with(env_filter)
            .init();

        info!("tokio-console enabled on http://127.0.0.1:6669");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_thread_ids(true)
            .with_target(true)
            .init();
    }

    flightdeck::run_server(args.config).await
}
