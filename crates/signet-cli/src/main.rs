use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use signet_cli::cli::commands::{self, Session};
use signet_cli::cli::CliConfig;
use signet_cli::tracing_setup::init_tracing;

#[derive(Parser)]
#[command(name = "signet")]
#[command(about = "Manage a nostr profile, relay list and bunker sessions")]
struct Cli {
    /// Path to JSON config file (credentials, coordinator, core settings)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Secret key (nsec or hex); overrides the config file
    #[arg(long, env = "SIGNET_NSEC", hide_env_values = true)]
    nsec: Option<String>,

    /// Coordination endpoint for bunker configs
    #[arg(long)]
    coordinator: Option<String>,

    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream bunker profiles and other state changes until Ctrl-C
    Watch,

    /// Print the relay list with relay descriptors
    Relays,

    /// Publish profile metadata, merged over the latest published version
    PublishProfile {
        /// Field to set (can be specified multiple times)
        #[arg(long = "field", short = 'f', value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Publish a relay list
    PublishRelays {
        /// Relay url, optionally suffixed with :read or :write (can be specified multiple times)
        #[arg(long = "relay", short = 'r', value_name = "URL[:read|:write]", required = true)]
        relays: Vec<String>,
    },

    /// Mine an unsigned record to a proof-of-work difficulty
    Mine {
        #[arg(long, short = 'k', default_value_t = 1)]
        kind: u16,
        #[arg(long, default_value = "")]
        content: String,
        /// Required leading zero bits
        #[arg(long, short = 'd')]
        difficulty: u8,
    },

    /// Print the bunker URI for a host and secret
    Uri {
        /// Bunker host public key (hex)
        #[arg(long)]
        host: String,
        #[arg(long)]
        secret: String,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing() {
        eprintln!("Warning: {:#}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config =
        CliConfig::resolve(cli.config.as_deref())?.with_overrides(cli.nsec, cli.coordinator);
    let pretty = cli.pretty;

    match cli.command {
        Commands::Watch => {
            let stop = commands::interrupt_flag()?;
            let session = Session::start(&config)?;
            let result = commands::watch(&session, &stop, pretty);
            session.shutdown();
            result
        }
        Commands::Relays => {
            let session = Session::start(&config)?;
            let relays = commands::relays(&session);
            session.shutdown();
            commands::print_json(&serde_json::to_value(relays?)?, pretty)
        }
        Commands::PublishProfile { fields } => {
            let fields = commands::parse_fields(&fields)?;
            let session = Session::start(&config)?;
            let event_id = commands::publish_profile(&session, fields);
            session.shutdown();
            commands::print_json(&json!({ "event_id": event_id? }), pretty)
        }
        Commands::PublishRelays { relays } => {
            let session = Session::start(&config)?;
            let event_id = commands::publish_relays(&session, &relays);
            session.shutdown();
            commands::print_json(&json!({ "event_id": event_id? }), pretty)
        }
        Commands::Mine {
            kind,
            content,
            difficulty,
        } => {
            let keys = config.keys()?;
            let mined = commands::mine(
                &keys.public_key(),
                kind,
                &content,
                difficulty,
                config.core.pow_workers,
            )?;
            commands::print_json(&mined, pretty)
        }
        Commands::Uri { host, secret } => {
            let coordinator = config
                .coordinator
                .as_deref()
                .or_else(|| config.core.default_coordinator())
                .context("No coordinator configured")?;
            println!("{}", commands::uri(&host, coordinator, &secret)?);
            Ok(())
        }
    }
}
