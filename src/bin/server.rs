//! Reflex server binary.
//!
//! Usage: reflex-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a fresh configuration template
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use reflex::dispatch::DirectDispatcher;
use reflex::{Handler, InboundConfig};

/// On-disk configuration: listen address plus the inbound engine config.
#[derive(Serialize, Deserialize)]
struct ServerConfigFile {
    /// Address the listener binds, e.g. "0.0.0.0:443"
    listen: String,
    #[serde(flatten)]
    inbound: InboundConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"Reflex Server - obfuscated transport inbound

USAGE:
    reflex-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a fresh configuration template
    -h, --help              Print help information

EXAMPLES:
    Generate a new configuration:
        reflex-server --generate > server.json

    Run the server:
        reflex-server --config server.json
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    use reflex::config::{ClientConfig, FallbackConfig};

    let config = ServerConfigFile {
        listen: "0.0.0.0:443".into(),
        inbound: InboundConfig {
            clients: vec![ClientConfig {
                id: uuid::Uuid::new_v4().to_string(),
                policy: Some("youtube".into()),
                level: 0,
            }],
            fallback: Some(FallbackConfig { dest: 8080 }),
        },
    };

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let config: ServerConfigFile = serde_json::from_str(&content)?;

    let handler = Arc::new(Handler::new(config.inbound)?);
    let dispatcher = Arc::new(DirectDispatcher);

    let listener = TcpListener::bind(&config.listen).await?;
    tracing::info!("reflex server listening on {}", config.listen);
    tracing::info!("authorized clients: {}", handler.users().len());

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("set_nodelay failed for {}: {}", peer_addr, e);
                }

                let handler = Arc::clone(&handler);
                let dispatcher = Arc::clone(&dispatcher);

                tokio::spawn(async move {
                    if let Err(e) = handler.process(stream, dispatcher.as_ref()).await {
                        tracing::debug!("connection from {} ended: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("accept error: {}", e);
            }
        }
    }
}
