use clap::{Parser, Subcommand};

use datafetch::{AppSettings, RecipeRegistry};

/// Configurable data-acquisition engine pulling bundles from HTTP and SFTP
/// sources into object storage.
#[derive(Parser, Debug)]
#[command(name = "datafetch")]
#[command(version)]
#[command(about = "Data-acquisition engine for HTTP and SFTP sources", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Credential provider: aws or environment
    #[arg(long, global = true, value_name = "PROVIDER")]
    credentials_provider: Option<String>,

    /// Storage backend: s3 or file
    #[arg(long, global = true, value_name = "BACKEND")]
    storage: Option<String>,

    /// Key-value store: memory or redis
    #[arg(long, global = true, value_name = "STORE")]
    kvstore: Option<String>,

    /// Local development mode: memory kv store, filesystem storage,
    /// environment credentials, log-only notifications
    #[arg(long, global = true)]
    dev_mode: bool,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format: text or json
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the fetcher for one data registry
    Run {
        /// Identifier of the data registry to fetch
        data_registry_id: String,
    },
    /// Check that the configured components are reachable
    Health,
}

fn main() {
    // Invalid arguments exit with code 2 via clap; configuration and runtime
    // failures exit with code 1 below.
    let cli = Cli::parse();

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = AppSettings::from_env()?;
    apply_cli_overrides(&mut settings, &cli)?;

    datafetch::init_logging(&settings);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build tokio runtime: {e}"))?
        .block_on(async {
            match cli.command {
                Command::Run { data_registry_id } => {
                    let registry = RecipeRegistry::builtin();
                    datafetch::run_command(&data_registry_id, &settings, &registry).await?;
                    Ok(())
                }
                Command::Health => datafetch::health_command(&settings).await,
            }
        })
}

fn apply_cli_overrides(settings: &mut AppSettings, cli: &Cli) -> anyhow::Result<()> {
    if let Some(provider) = &cli.credentials_provider {
        settings.credentials_provider = provider.parse()?;
    }
    if let Some(storage) = &cli.storage {
        settings.storage = storage.parse()?;
    }
    if let Some(kvstore) = &cli.kvstore {
        settings.kv_store = kvstore.parse()?;
    }
    if let Some(level) = &cli.log_level {
        settings.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        settings.log_format = format.parse()?;
    }
    if cli.dev_mode {
        settings.apply_dev_mode();
    }
    Ok(())
}
