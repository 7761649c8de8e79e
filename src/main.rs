use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use podnet::config::cli::{self, CliArgs, Command};
use podnet::config::load_configuration;
use podnet::error::AppError;
use podnet::network::{generate_filters, ContainerNetwork, NetworkBackend};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        cli::print_default_config();
        return Ok(());
    }

    let config = load_configuration(&cli)?;

    // Logs go to stderr so stdout stays valid JSON.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    if cli.validate_config {
        info!(backend = %config.backend, "Configuration is valid");
        return Ok(());
    }

    debug!(?config, "Loaded configuration");
    let backend = NetworkBackend::from_config(&config)?;
    info!(
        backend = %backend.kind(),
        config_dir = config.network_config_dir(),
        "Network backend ready"
    );

    let command = cli
        .command
        .clone()
        .unwrap_or(Command::List { filters: Vec::new() });

    let output = match command {
        Command::List { filters } => {
            let filters = generate_filters(&cli::parse_filter_args(&filters)?)?;
            let networks = backend.network_list(&filters).await?;
            serde_json::to_string_pretty(&networks)?
        }
        Command::Inspect { name } => {
            let network = backend.network_inspect(&name).await?;
            serde_json::to_string_pretty(&network)?
        }
    };
    println!("{}", output);

    Ok(())
}
