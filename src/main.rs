use anyhow::Result;
use clap::Parser;
use log::info;

use regburst::config::AppConfig;
use regburst::server;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind host for the REST/WebSocket front door
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .format_level(false)
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("regburst v{}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let cfg = AppConfig::from_env(&args.host, args.port)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::serve(cfg))
}
