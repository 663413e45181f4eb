// src/main.rs
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mazurka::Server;

#[derive(Parser)]
#[command(name = "mazurka")]
#[command(about = "Edge-triggered epoll static file server")]
#[command(version)]
struct Cli {
    /// Address and port to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Directory served as the document root
    #[arg(long, default_value = ".")]
    doc_root: PathBuf,

    /// Worker threads; defaults to the number of CPUs
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum number of tracked connections
    #[arg(long, default_value_t = mazurka::server::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut server = Server::bind(&cli.listen)
        .doc_root(cli.doc_root)
        .max_connections(cli.max_connections);
    if let Some(workers) = cli.workers {
        server = server.workers(workers);
    }

    if let Err(e) = server.serve() {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
