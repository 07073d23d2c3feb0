mod backhaul;

use std::{net::IpAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use backhaul::{app, config::LoggingConfig, echo};

#[derive(Debug, Parser)]
#[command(
    name = "backhaul",
    version,
    about = "Backhaul - reverse TCP/UDP tunnel"
)]
struct Cli {
    #[command(flatten)]
    log: LogArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// Log level (error, warn, info, debug, trace). RUST_LOG overrides it.
    #[arg(long, global = true, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format: text or json.
    #[arg(long, global = true, env = "BACKHAUL_LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Log output: stderr, stdout, discard, or a file path.
    #[arg(long, global = true, env = "BACKHAUL_LOG_OUTPUT", default_value = "stderr")]
    log_output: String,

    /// Include source file and line in log records.
    #[arg(long, global = true, env = "BACKHAUL_LOG_SOURCE")]
    log_source: bool,
}

impl From<LogArgs> for LoggingConfig {
    fn from(a: LogArgs) -> Self {
        Self {
            level: a.log_level,
            format: a.log_format,
            output: a.log_output,
            add_source: a.log_source,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the public server that exposes client tunnels.
    Server(ServerArgs),
    /// Connect to a server and expose local services through it.
    Client(ClientArgs),
    /// Run a UDP echo service for testing UDP tunnels.
    UdpEcho(EchoArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Control listener address; overrides --control-port when set.
    #[arg(long, env = "CONTROL_ADDR")]
    control_addr: Option<String>,

    /// Control port, bound on all IPv4 interfaces. Use --control-addr [::]:PORT for IPv6.
    #[arg(long, env = "CONTROL_PORT", default_value_t = 5000)]
    control_port: u16,

    /// Shared secret clients must present.
    #[arg(long, env = "SECRET_KEY", default_value = "changeme", hide_env_values = true)]
    secret: String,

    /// Interface the allocated tunnel listeners bind to.
    #[arg(long, env = "BACKHAUL_BIND_HOST", default_value = "0.0.0.0")]
    bind_host: IpAddr,
}

#[derive(Debug, Args)]
struct ClientArgs {
    /// Path to the client config (.json/.toml/.yaml/.yml). If omitted, uses BACKHAUL_CONFIG; then auto-detects backhaul.json > config.json > backhaul.toml > backhaul.yaml > backhaul.yml in the CWD.
    #[arg(long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EchoArgs {
    #[arg(long, default_value_t = echo::DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let logging = LoggingConfig::from(cli.log);

    match cli.command {
        Command::Server(a) => {
            let control_addr = a
                .control_addr
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!(":{}", a.control_port));
            app::run_server(
                logging,
                app::ServerSettings {
                    control_addr,
                    secret: a.secret,
                    bind_host: a.bind_host,
                },
            )
            .await
        }
        Command::Client(a) => app::run_client(logging, a.config).await,
        Command::UdpEcho(a) => app::run_udp_echo(logging, a.port).await,
    }
}
