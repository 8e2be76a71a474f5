use anyhow::Result;
use clap::{Args, Parser, Subcommand, error::ErrorKind};
use std::{path::PathBuf, process::ExitCode};
use tracing::{Level, error};

use ws_tcp_tunnel::{
    Config, PairConfig, TlsConfig, load_config, parse_pair, run_server, run_test_client,
};

/// Tunnel TCP traffic through WebSocket connections
#[derive(Parser, Debug)]
#[command(name = "ws-tcp-tunnel", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start one or more tunnel pairs and run until interrupted
    Server(ServerArgs),
    /// Relay standard input/output over one WebSocket connection
    #[command(alias = "test-wsclient")]
    TestClient {
        /// WebSocket server, e.g. localhost:1234, :1234 or ws://host:port/
        ws_addr: String,
    },
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Allowed client IPs or networks, comma separated (e.g. 192.168.0.0/24)
    #[arg(long)]
    ip: Option<String>,

    /// Log every relayed chunk and admission decision
    #[arg(long)]
    verbose: bool,

    /// Maximum live sessions per pair, counting both sides
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Buffers per relay direction
    #[arg(long)]
    pool_size: Option<usize>,

    /// Retire a connection whose counterpart has been gone this many seconds
    #[arg(long, value_name = "SECS")]
    stall_timeout: Option<u64>,

    /// PEM certificate chain for serving wss://
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    /// PEM private key for serving wss://
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// TOML file with additional pairs and relay tuning
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Tunnel pairs as <ws-addr>,<tcp-addr>, e.g. :8080,:2222
    #[arg(value_parser = parse_pair, value_name = "WS_ADDR,TCP_ADDR")]
    pairs: Vec<PairConfig>,
}

impl ServerArgs {
    /// Merges the optional config file with command line pairs. Admission
    /// and TLS flags apply to the command line pairs.
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };

        config.verbose |= self.verbose;
        if let Some(pool_size) = self.pool_size {
            config.relay.pool_size = pool_size;
        }
        if self.stall_timeout.is_some() {
            config.relay.stall_timeout_secs = self.stall_timeout;
        }

        let tls = self
            .tls_cert
            .zip(self.tls_key)
            .map(|(cert_file, key_file)| TlsConfig {
                cert_file,
                key_file,
            });
        let ip = self.ip.filter(|ip| !ip.trim().is_empty());
        config.pairs.extend(self.pairs.into_iter().map(|pair| PairConfig {
            allowed_ips: ip.clone().map(|ip| vec![ip]),
            max_sessions: self.max_sessions,
            tls: tls.clone(),
            ..pair
        }));

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    match cli.command {
        Command::Server(args) => {
            let config = match args.into_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    return ExitCode::from(1);
                }
            };
            init_tracing(config.verbose);
            if let Err(e) = run_server(config).await {
                error!(error = ?e, "Server failed");
                return ExitCode::FAILURE;
            }
        }
        Command::TestClient { ws_addr } => {
            init_tracing(false);
            if let Err(e) = run_test_client(&ws_addr).await {
                error!(error = ?e, "Test client failed");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
