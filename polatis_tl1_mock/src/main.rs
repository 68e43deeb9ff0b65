use std::path::PathBuf;

use clap::Parser;
use polatis_tl1_mock::{MockConfig, MockSwitch};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mock Polatis switch (TL1 over TCP)")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TL1 port
    #[arg(long, default_value_t = 3082)]
    port: u16,

    /// Optional TOML file with switch settings (credentials, size, name, ...)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => toml::from_str::<MockConfig>(&std::fs::read_to_string(path)?)?,
        None => MockConfig::default(),
    };
    tracing::info!(
        "switch {:?} size {}x{} user {}",
        config.switch_name,
        config.size_a,
        config.size_b,
        config.user
    );

    MockSwitch::with_config(config)
        .run(&format!("{}:{}", args.host, args.port))
        .await
}
