mod detour;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "detour",
    version,
    about = "Detour - session-multiplexed TCP relay over one encrypted connection"
)]
struct Cli {
    /// Path to config file (.toml/.yaml/.yml). If omitted, uses DETOUR_CONFIG; then auto-detects detour.toml > detour.yaml > detour.yml from CWD; then the OS default path (Linux: /etc/detour/detour.toml; others: user config dir). Built-in defaults apply when none exists.
    #[arg(long, env = "DETOUR_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Accept relay connections and dial destinations on behalf of clients.
    Server(ServerArgs),
    /// Accept local clients and carry them to a remote server.
    Local(LocalArgs),
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// Shared secret.
    #[arg(short = 'p', long)]
    password: Option<String>,
    /// Relay listen address, e.g. tcp://0.0.0.0:3811.
    #[arg(short = 'l', long)]
    listen: Option<String>,
    /// Admin HTTP address (health, sessions, metrics).
    #[arg(long)]
    admin: Option<String>,
}

#[derive(Debug, Args)]
struct LocalArgs {
    /// Shared secret.
    #[arg(short = 'p', long)]
    password: Option<String>,
    /// Local listen address, e.g. tcp://0.0.0.0:3810.
    #[arg(short = 'l', long)]
    listen: Option<String>,
    /// Remote server endpoints, comma separated.
    #[arg(short = 'r', long)]
    remote: Option<String>,
    /// Client protocol: socks5 or forward.
    #[arg(short = 't', long = "proto")]
    proto: Option<String>,
    /// Fixed target for forward mode, host:port.
    #[arg(long)]
    forward_to: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (mode, overrides) = match cli.mode {
        Mode::Server(a) => (
            detour::app::Mode::Server,
            detour::config::Overrides {
                password: a.password,
                listen: a.listen,
                admin_addr: a.admin,
                ..Default::default()
            },
        ),
        Mode::Local(a) => (
            detour::app::Mode::Local,
            detour::config::Overrides {
                password: a.password,
                listen: a.listen,
                remotes: a.remote,
                protocol: a.proto,
                forward_target: a.forward_to,
                ..Default::default()
            },
        ),
    };
    detour::run(cli.config, mode, overrides).await
}
