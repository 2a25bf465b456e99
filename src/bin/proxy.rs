//! SMTP Forward Proxy Binary

use anyhow::Result;
use clap::Parser;
use smtp_forward_proxy::config::{Config, generate_example_config};
use smtp_forward_proxy::{ForwardingQueue, Handler, ProxyServer, logging};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// SMTP Forward Proxy
#[derive(Parser, Debug)]
#[command(name = "smtp-forward-proxy")]
#[command(about = "HTTP proxy that delivers web-mail compose requests over SMTP")]
#[command(version = smtp_forward_proxy::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the listen address
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        print!("{}", generate_example_config());
        return Ok(());
    }

    // Load config
    let mut config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        eprintln!("Error: Config file not found: {}", args.config.display());
        eprintln!("Create one with:");
        eprintln!();
        eprintln!("  smtp-forward-proxy --example-config > config.yaml");
        std::process::exit(1);
    };
    if let Some(host) = args.host {
        config.proxy.host = host;
    }
    if let Some(port) = args.port {
        config.proxy.port = port;
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.debug {
            "debug"
        } else {
            config.log_level.as_str()
        })
    });
    let _log_guard = logging::init(filter, config.log_dir.as_deref());

    config.validate()?;
    let account = config.intercept_account()?;

    info!("SMTP Forward Proxy {}", smtp_forward_proxy::VERSION);
    info!(
        "Delivering {}{} as {} via {}",
        config.intercept.webserver,
        config.intercept.path,
        account.username,
        account.server()
    );

    let queue = ForwardingQueue::start(config.smtp.clone());
    let handler = Handler::new(&config, queue)?;
    ProxyServer::new(config.proxy.clone(), handler).run().await?;

    Ok(())
}
