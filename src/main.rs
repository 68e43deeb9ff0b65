use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use polatis_l1::config;
use polatis_l1::polatis::PolatisHandler;
use polatis_l1::server::{ConnectionServer, ServerOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "L1 driver for Polatis optical switches")]
struct Args {
    /// TCP port the controller connects to
    listen_port: u16,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let cfg = config::config();
    tracing::info!(
        "port mode {:?}, device port {}, reply timeout {:?}",
        cfg.port_mode,
        cfg.device_port,
        cfg.reply_timeout()
    );

    let handler = Arc::new(PolatisHandler::from_config(cfg));
    let server = ConnectionServer::new(handler, ServerOptions::from(cfg));
    server
        .listen(&cfg.listen_host, args.listen_port, cfg.backlog)
        .await
        .with_context(|| format!("serving controller port {}", args.listen_port))
}
