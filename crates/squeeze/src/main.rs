//! A SOCKS5 proxy that throttles all of its connections to one aggregate
//! bandwidth limit.
//!
//! The interesting machinery lives in the `squeeze-ratelim` crate; this
//! binary parses the command line, builds the process-wide [`Limiter`], and
//! runs the listener.

use std::sync::Arc;

use clap::Parser;
use squeeze_ratelim::Limiter;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod limit;
mod proxy;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on for incoming SOCKS5 connections, for example
    /// "localhost:3218".
    #[arg(short, long)]
    listen: String,

    /// Aggregate bandwidth limit in <number><unit> format. Allowed units
    /// are GBps, Gbps, MBps, Mbps, KBps, Kbps, Bps, bps; a bare number is
    /// bits per second, and 0 disables the limit.
    #[arg(short, long)]
    bandwidth: limit::BandwidthLimit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.bandwidth.is_unlimited() {
        info!("bandwidth limit disabled");
    } else {
        info!(
            "limiting aggregate bandwidth to {} bytes/sec",
            args.bandwidth.bytes_per_sec(),
        );
    }

    let limiter = Arc::new(Limiter::new(args.bandwidth.bytes_per_sec()));
    proxy::run(&args.listen, limiter).await
}
