//! StreamKV server binary.
//!
//! Parses the command line, sets up logging, starts the expiry sweeper and
//! accepts client connections until Ctrl-C.

use anyhow::{bail, Context};
use std::sync::Arc;
use streamkv::commands::CommandHandler;
use streamkv::connection::{handle_connection, ConnectionStats};
use streamkv::storage::{ExpiryConfig, ExpirySweeper, StorageEngine};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: streamkv::DEFAULT_HOST.to_string(),
            port: streamkv::DEFAULT_PORT,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, PartialEq, Eq)]
enum Invocation {
    Serve(Config),
    Help,
    Version,
}

impl Config {
    /// Parses the arguments that follow the program name.
    fn parse<I>(args: I) -> anyhow::Result<Invocation>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Config::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => {
                    config.host = args.next().context("--host requires a value")?;
                }
                "--port" | "-p" => {
                    let port = args.next().context("--port requires a value")?;
                    config.port = port
                        .parse::<u16>()
                        .with_context(|| format!("invalid port number: {}", port))?;
                }
                "--help" => return Ok(Invocation::Help),
                "--version" | "-v" => return Ok(Invocation::Version),
                other => bail!("unknown argument: {}", other),
            }
        }

        Ok(Invocation::Serve(config))
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
StreamKV - An In-Memory Data Store Speaking RESP

USAGE:
    streamkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>    Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>    Port to listen on (default: 6379)
    -v, --version        Print version information
        --help           Print this help message

ENVIRONMENT:
    RUST_LOG             Log filter (default: info), e.g. RUST_LOG=streamkv=debug

CONNECTING:
    $ redis-cli -p 6379
    127.0.0.1:6379> RPUSH jobs a b
    (integer) 2
    127.0.0.1:6379> BLPOP jobs 0
    1) "jobs"
    2) "a"
    127.0.0.1:6379> XADD events * kind login
    1700000000000-0
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match Config::parse(std::env::args().skip(1)) {
        Ok(Invocation::Serve(config)) => config,
        Ok(Invocation::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Invocation::Version) => {
            println!("StreamKV version {}", streamkv::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logger")?;

    let storage = Arc::new(StorageEngine::new());
    let _sweeper = ExpirySweeper::start(Arc::clone(&storage), ExpiryConfig::default());

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(
        version = streamkv::VERSION,
        address = %config.bind_address(),
        "StreamKV ready to accept connections"
    );

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping server..."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&storage), Arc::clone(&stats)) => {}
        _ = shutdown => {}
    }

    info!(
        connections = stats.accepted.load(std::sync::atomic::Ordering::Relaxed),
        keys = storage.len(),
        "Server shutdown complete"
    );
    Ok(())
}

/// Accepts connections forever, one task per client.
async fn accept_loop(
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    stats: Arc<ConnectionStats>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = CommandHandler::new(Arc::clone(&storage));
                let stats = Arc::clone(&stats);

                tokio::spawn(handle_connection(stream, addr, handler, stats));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Invocation> {
        Config::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        let invocation = parse(&[]).unwrap();
        assert_eq!(invocation, Invocation::Serve(Config::default()));
        assert_eq!(Config::default().bind_address(), "127.0.0.1:6379");
    }

    #[test]
    fn test_host_and_port() {
        let invocation = parse(&["-h", "0.0.0.0", "--port", "6380"]).unwrap();
        assert_eq!(
            invocation,
            Invocation::Serve(Config {
                host: "0.0.0.0".to_string(),
                port: 6380,
            })
        );
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(parse(&["--help"]).unwrap(), Invocation::Help);
        assert_eq!(parse(&["-p", "1", "-v"]).unwrap(), Invocation::Version);
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse(&["--port"]).is_err());
        assert!(parse(&["--port", "99999"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
    }
}
