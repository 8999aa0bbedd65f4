use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rtsp_relay::config::RelayConfig;
use rtsp_relay::metrics::MetricsCollector;
use rtsp_relay::{Lifecycle, PipelineManager, Server};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rtsp-relay", version, about = "RTSP ingest and HTTP re-streaming relay")]
struct Cli {
    /// Config file, without extension.
    #[arg(long, default_value = "config/relay")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a standalone RTSP server with canned responses.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Pull an RTSP source and serve it over HTTP.
    Relay {
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        hls_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = RelayConfig::load(&cli.config)?;

    if config.enable_metrics {
        let addr: SocketAddr = config.metrics_bind_address.parse()?;
        MetricsCollector::init(addr);
    }

    info!("Starting rtsp-relay v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            let server = Server::with_default_handler(config.server.clone());
            server.start().await?;
            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping server...");
            server.stop().await?;
        }
        Command::Relay { url, listen, hls_dir } => {
            if let Some(url) = url {
                config.rtsp.url = url;
            }
            if let Some(listen) = listen {
                config.distributor.listen_address = listen;
            }
            if let Some(dir) = hls_dir {
                config.transcoder.hls.output_dir = dir;
            }

            let pipeline = PipelineManager::new(&config)?;
            pipeline.start().await?;
            for (stream_type, url) in pipeline.output_urls() {
                info!(%stream_type, %url, "output available");
            }

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping pipeline...");
            if let Err(e) = pipeline.stop().await {
                error!("Pipeline stop error: {}", e);
            }
        }
    }

    Ok(())
}
