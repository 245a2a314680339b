use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fabricview::config::Config;
use fabricview::server;

#[derive(Debug, Parser)]
#[command(name = "fabricview", about = "Network fabric analytics API", version)]
struct Cli {
    /// Path to a TOML config file; defaults to the per-user config dir.
    #[arg(long, env = "FABRICVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long, env = "FABRICVIEW_HOST")]
    host: Option<IpAddr>,

    /// Override the listen port.
    #[arg(long, env = "FABRICVIEW_PORT")]
    port: Option<u16>,

    /// Override the graph store URI.
    #[arg(long, env = "FABRICVIEW_GRAPH_URI")]
    graph_uri: Option<String>,

    /// Override the columnar store URL.
    #[arg(long, env = "FABRICVIEW_COLUMNAR_URL")]
    columnar_url: Option<String>,

    /// Override the cache refresh interval in seconds.
    #[arg(long, env = "FABRICVIEW_REFRESH_SECS")]
    refresh_secs: Option<u64>,

    /// Disable the composite refresh cache.
    #[arg(long)]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fabricview: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(host) = cli.host {
        config.http.host = host;
    }
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if let Some(uri) = cli.graph_uri {
        config.graph.uri = uri;
    }
    if let Some(url) = cli.columnar_url {
        config.columnar.url = url;
    }
    if let Some(secs) = cli.refresh_secs {
        config.cache.refresh_interval_secs = secs;
    }
    if cli.no_cache {
        config.cache.enabled = false;
    }

    match server::serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fabricview: {err}");
            ExitCode::FAILURE
        }
    }
}
