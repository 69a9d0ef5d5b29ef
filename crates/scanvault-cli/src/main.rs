mod bootstrap;
mod cli;
mod commands;
mod config;

use crate::cli::{Command, ConfigCommand, KeysCommand};
use clap::Parser;
use color_eyre::Result;
use scanvault_kms::secret::provision_keyring;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(cli.config.as_deref())?,
        Command::Keys(KeysCommand::Init { service, account }) => init_keys(&service, &account)?,
        command => {
            let store = bootstrap::open_store(&config).await?;
            commands::handle(command, &store, &config).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("scanvault {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(path: Option<&std::path::Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_path()?,
    };
    let path = config::write_if_missing(&config::Config::starter(), &path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn init_keys(service: &str, account: &str) -> Result<()> {
    let created =
        provision_keyring(service, account).map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    if created {
        println!("Master secret created in keyring ({service}/{account})");
    } else {
        println!("Master secret already present in keyring ({service}/{account})");
    }
    Ok(())
}
