use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wc_bridge::{BridgeRegistry, FileStorageAdapter};

mod commands;
mod config;
mod output;
mod ws_transport;

use output::Output;
use ws_transport::WsTransportBuilder;

#[derive(Parser)]
#[command(name = "wcb")]
#[command(version)]
#[command(about = "Wallet-side WalletConnect v1 bridge client")]
#[command(long_about = "Pairs with dApps through WalletConnect v1 bridges and keeps the sessions.\n\nDesigned for humans, agents and automation.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/wcb)
    #[arg(long, global = true, env = "WCB_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pair with a dApp and stay connected until Ctrl-C
    Pair {
        /// Pairing URI (wc:...)
        uri: String,
        /// Account to approve the session with (defaults to the configured one)
        #[arg(short, long)]
        account: Option<String>,
    },

    /// List stored sessions
    List {
        /// Only sessions approved for or bound to this account
        #[arg(short, long)]
        account: Option<String>,
    },

    /// Show one session
    Show {
        /// Session ID
        id: String,
    },

    /// Close a session and notify the dApp
    Close {
        /// Session ID
        id: String,
    },

    /// Reconnect every stored session and stream its events
    Listen {
        /// Answer every incoming request with "Transaction rejected"
        #[arg(long)]
        reject: bool,
    },

    /// Show the effective configuration
    Config,

    /// Set the default account for new pairings
    SetAccount {
        /// Account address (0x...)
        account: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("WCB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let output = Output::new(cli.json);

    let result = run(cli, &output).await;

    if let Err(e) = result {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not find data directory")?
            .join("wcb"),
    };

    std::fs::create_dir_all(&data_dir)?;

    let mut config = config::Config::load(&data_dir)?;
    let storage = FileStorageAdapter::new(data_dir.join("sessions"))
        .context("Failed to open session storage")?;
    let registry = BridgeRegistry::new(
        Arc::new(storage),
        Arc::new(WsTransportBuilder),
        config.bridge.clone(),
    );

    match cli.command {
        Commands::Pair { uri, account } => {
            let account = config.account_or(account);
            commands::session::pair(&uri, account, &registry, output).await
        }
        Commands::List { account } => {
            commands::session::list(account.as_deref(), &registry, output).await
        }
        Commands::Show { id } => {
            commands::session::show(&id, &registry, output).await
        }
        Commands::Close { id } => {
            commands::session::close(&id, &registry, output).await
        }
        Commands::Listen { reject } => {
            commands::session::listen(reject, &registry, output).await
        }
        Commands::Config => {
            commands::settings::show(&config, &data_dir, output).await
        }
        Commands::SetAccount { account } => {
            commands::settings::set_account(&account, &mut config, output).await
        }
    }
}
