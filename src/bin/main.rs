use std::path::PathBuf;

use clap::{Parser, Subcommand};
use enhttp::ServerConfig;
use enhttp::config::PartialServerConfig;

/// Tunnels a bidirectional byte stream inside a sequence of HTTP POST
/// request/response exchanges.
#[derive(Parser)]
#[command(name = "enhttp")]
#[command(version)]
#[command(about = "Tunnels TCP byte streams over sequential HTTP POST exchanges")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Serve {
        /// Path to a TOML config file; CLI flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on
        #[arg(long)]
        bind_addr: Option<std::net::SocketAddr>,

        /// Seconds of inactivity before an idle virtual connection is reaped
        #[arg(long)]
        idle_timeout_secs: Option<u64>,

        /// Value to advertise as X-Server-URL on first-POST responses
        #[arg(long)]
        sticky_url: Option<String>,
    },
    /// Manage configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print a default configuration file to stdout, or write it with --output
    Init {
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        force: bool,
    },
}

fn main() {
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            config,
            bind_addr,
            idle_timeout_secs,
            sticky_url,
        }) => run_serve(config, bind_addr, idle_timeout_secs, sticky_url),
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { output, force } => run_config_init(output, force),
        },
        None => run_serve(None, None, None, None),
    }
}

fn load_config(path: Option<PathBuf>) -> ServerConfig {
    match path {
        None => ServerConfig::default(),
        Some(path) => {
            let raw = std::fs::read_to_string(&path).unwrap_or_else(|e| {
                eprintln!("failed to read config file {}: {e}", path.display());
                std::process::exit(1);
            });
            ServerConfig::from_toml_str(&raw).unwrap_or_else(|e| {
                eprintln!("failed to parse config file {}: {e}", path.display());
                std::process::exit(1);
            })
        }
    }
}

fn run_serve(
    config_path: Option<PathBuf>,
    bind_addr: Option<std::net::SocketAddr>,
    idle_timeout_secs: Option<u64>,
    sticky_url: Option<String>,
) {
    let config = load_config(config_path).merged_with(PartialServerConfig {
        bind_addr,
        idle_timeout_secs,
        sticky_url,
    });

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("failed to start async runtime: {e}");
        std::process::exit(1);
    });

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("failed to bind {}: {e}", config.bind_addr);
                std::process::exit(1);
            }
        };

        log::info!(target: "enhttp::bin", "listening on {}", config.bind_addr);

        tokio::select! {
            result = enhttp::serve(listener, config) => {
                if let Err(e) = result {
                    eprintln!("server error: {e}");
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!(target: "enhttp::bin", "shutting down on ctrl-c");
            }
        }
    });
}

fn run_config_init(output: Option<PathBuf>, force: bool) {
    if force && output.is_none() {
        eprintln!("Warning: --force has no effect without --output");
    }

    let config = ServerConfig::default();
    let rendered = config.to_toml_string().unwrap_or_else(|e| {
        eprintln!("failed to serialize default configuration: {e}");
        std::process::exit(1);
    });

    match output {
        None => print!("{rendered}"),
        Some(path) if path.as_os_str() == "-" => print!("{rendered}"),
        Some(path) => {
            if path.exists() && !force {
                eprintln!(
                    "Error: file '{}' already exists. Use --force to overwrite.",
                    path.display()
                );
                std::process::exit(1);
            }
            if let Err(e) = std::fs::write(&path, &rendered) {
                eprintln!("failed to write configuration file: {e}");
                std::process::exit(1);
            }
            eprintln!("Created configuration file: {}", path.display());
        }
    }
}
