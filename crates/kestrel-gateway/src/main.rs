use clap::Parser;
use tracing::warn;

use kestrel_core::KestrelConfig;
use kestrel_gateway::app::App;

#[derive(Parser)]
#[command(name = "kestrel", about = "Autonomous agent runtime", version)]
struct Args {
    /// Path to kestrel.toml (default: ~/.kestrel/kestrel.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel=info,kestrel_gateway=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = KestrelConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        KestrelConfig::default()
    });

    // Wire-level IM adapters register here before `run` — they live out of
    // tree and plug in through `Gateway::register_adapter`.
    let app = App::build(&config)?;
    app.run().await
}
