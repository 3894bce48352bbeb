use clap::Parser;
use std::path::PathBuf;
use tern::{Config, Server, TernResult};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tern")]
#[command(about = "Static file server built on epoll and a worker pool")]
#[command(version)]
struct Cli {
    /// Configuration file (key=value lines)
    #[arg(long, short, default_value = Config::DEFAULT_PATH)]
    config: PathBuf,

    /// Directory to serve, overriding `root` from the config file
    #[arg(long)]
    root: Option<PathBuf>,

    /// Port to listen on, overriding `port` from the config file
    #[arg(long, short)]
    port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> TernResult<()> {
    let (mut config, warnings) = Config::load(&cli.config)?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    tern::init_logging(&config)?;
    for warning in &warnings {
        warn!("{}", warning);
    }

    let server = Server::bind(&config)?;
    let handle = server.handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping...");
        handle.shutdown();
    }) {
        warn!(error = %e, "could not install signal handler");
    }

    println!("Serving {} on http://{}", config.root.display(), server.local_addr());
    server.run()
}
