use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::RemoteAddr;
use tollgate::CallContext;

/// Tiered HTTP admission control backed by a shared rate-counter store.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a configuration file and print the resolved settings
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Evaluate a synthetic request against the configured limiter
    Probe {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// Request path
        #[arg(short, long, default_value = "/")]
        path: String,

        /// Raw remote socket address, e.g. 192.0.2.1:5555
        #[arg(long)]
        remote_addr: Option<String>,

        /// Extra header as NAME=VALUE, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Number of times to send the request
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::CheckConfig { config } => check_config(config),
        Command::Probe {
            config,
            method,
            path,
            remote_addr,
            headers,
            count,
        } => probe(config, method, path, remote_addr, headers, count).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check_config(path: PathBuf) -> anyhow::Result<()> {
    let config = TollgateConfig::from_file(&path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn probe(
    config: Option<PathBuf>,
    method: String,
    path: String,
    remote_addr: Option<String>,
    headers: Vec<String>,
    count: u32,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => TollgateConfig::from_file(&path)
            .with_context(|| format!("invalid configuration in {}", path.display()))?,
        None => TollgateConfig::default(),
    };

    let limiter = config
        .build_limiter()
        .await
        .context("failed to build limiter")?;
    info!(version = env!("CARGO_PKG_VERSION"), "Tollgate limiter ready");

    let mut builder = http::Request::builder().method(method.as_str()).uri(path.as_str());
    for header in &headers {
        let Some((name, value)) = header.split_once('=') else {
            bail!("header {:?} is not NAME=VALUE", header);
        };
        builder = builder.header(name.trim(), value.trim());
    }
    let mut request = builder.body(()).context("invalid request")?;
    if let Some(addr) = remote_addr {
        request.extensions_mut().insert(RemoteAddr(addr));
    }

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(token.clone()));

    for _ in 0..count {
        let mut ctx = CallContext::new().with_cancellation(token.clone());
        if let Some(timeout) = config.store.timeout() {
            ctx = ctx.with_timeout(timeout);
        }

        let decision = limiter.limit_by_request(&ctx, &request).await?;
        println!("{}", serde_json::to_string(&decision)?);
        if decision.limit_reached() {
            warn!(tier = ?decision.tier, "{}", limiter.message());
        }
    }

    Ok(())
}

/// Cancel in-flight checks on Ctrl+C.
async fn cancel_on_shutdown(token: CancellationToken) {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, cancelling in-flight checks");
        token.cancel();
    }
}
