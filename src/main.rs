use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use socks_tunnel::logging::{init_logging, LogLevel};
use socks_tunnel::{TunnelConfig, TunnelServer};

#[derive(Parser, Debug)]
#[command(name = "socks-tunnel", version, about = "SOCKS5 front-end with chained, encrypted upstreams")]
struct Args {
    /// Path to a JSON config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config (host:port)
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,

    /// Log level, overrides the config
    #[arg(long = "log-level")]
    log_level: Option<LogLevel>,
}

fn apply_listen(config: &mut TunnelConfig, listen: &str) -> socks_tunnel::Result<()> {
    let endpoint: socks_tunnel::endpoint::UnresolvedEndpoint = listen.parse()?;
    config.proxy_policy.bind_address = endpoint.host().to_string();
    config.proxy_policy.bind_port = endpoint.port();
    Ok(())
}

async fn run(args: Args) -> socks_tunnel::Result<()> {
    let mut config = match &args.config {
        Some(path) => TunnelConfig::load(path)?,
        None => TunnelConfig::default(),
    };
    if let Some(listen) = &args.listen {
        apply_listen(&mut config, listen)?;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    init_logging(config.log_level);

    info!("SOCKS5 tunnel starting");
    let mut server = TunnelServer::new(config)?;
    server.bind().await?;
    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        init_logging(LogLevel::Error);
        error!(error = %e, "tunnel exited");
        std::process::exit(1);
    }
}
