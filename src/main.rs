use std::path::PathBuf;

use clap::Parser;
use meterline::{
    MeterConfig, MeterEngine,
    config::DatabaseConfig,
    db::DbPool,
    observability::{self, TracingGuard, metrics},
};

/// Config file looked up in the working directory when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "meterline.toml";

#[derive(Parser, Debug)]
#[command(version, about = "Meterline usage metering engine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to ./meterline.toml if it exists,
    /// otherwise built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run database migrations and exit
    ///
    /// Useful for init containers or CI/CD pipelines.
    Migrate,
    /// Validate the configuration file and exit
    ///
    /// Also builds an engine over a scratch in-memory database, so plan and
    /// pricing definitions are checked the way startup checks them.
    CheckConfig,
    /// Compact the audit log and apply retention tiers
    ///
    /// Without --user only retention runs, across every user.
    Sweep {
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Print a user's usage summary as JSON
    Usage {
        #[arg(short, long)]
        user: String,
        /// Billing period (YYYY-MM), defaults to the current one
        #[arg(short, long)]
        period: Option<String>,
    },
    /// Export the JSON schema for the configuration file
    Schema {
        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Command::Migrate => run_migrate(args.config.as_deref()).await,
        Command::CheckConfig => run_check_config(args.config.as_deref()).await,
        Command::Sweep { user } => run_sweep(args.config.as_deref(), user.as_deref()).await,
        Command::Usage { user, period } => {
            run_usage(args.config.as_deref(), &user, period.as_deref()).await
        }
        Command::Schema { output } => {
            #[cfg(feature = "json-schema")]
            run_schema_export(output);
            #[cfg(not(feature = "json-schema"))]
            {
                let _ = output;
                eprintln!("Error: JSON schema export requires the 'json-schema' feature");
                std::process::exit(1);
            }
        }
    }
}

/// Find the config file: the explicit path, then ./meterline.toml.
/// `None` means run on defaults.
fn resolve_config_path(explicit_path: Option<&str>) -> Result<Option<PathBuf>, String> {
    if let Some(path) = explicit_path {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("Config file not found: {}", path.display()));
        }
        return Ok(Some(path));
    }

    let cwd_config = PathBuf::from(DEFAULT_CONFIG_FILE);
    if cwd_config.exists() {
        return Ok(Some(cwd_config));
    }
    Ok(None)
}

fn load_config(explicit_path: Option<&str>) -> MeterConfig {
    let path = match resolve_config_path(explicit_path) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let Some(path) = path else {
        return MeterConfig::default();
    };
    match MeterConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

/// Install logging and, when enabled, the metrics recorder.
fn init_observability(config: &MeterConfig) -> TracingGuard {
    let guard = match observability::init_tracing(&config.observability) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: Failed to initialize tracing: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Metrics recorder not installed");
    }
    guard
}

async fn open_engine(config: MeterConfig) -> MeterEngine {
    match MeterEngine::from_config(config).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start metering engine");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: Failed to serialize output: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_migrate(explicit_config_path: Option<&str>) {
    let config = load_config(explicit_config_path);
    let _tracing_guard = init_observability(&config);

    tracing::info!(path = %config.database.path, "Running database migrations");

    match DbPool::from_config(&config.database).await {
        Ok(pool) => match pool.run_migrations().await {
            Ok(()) => {
                tracing::info!("Database migrations completed successfully");
            }
            Err(e) => {
                tracing::error!(error = %e, "Database migrations failed");
                eprintln!("Error: Database migrations failed: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            eprintln!("Error: Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_check_config(explicit_config_path: Option<&str>) {
    let mut config = load_config(explicit_config_path);
    let _tracing_guard = init_observability(&config);

    let database = std::mem::replace(&mut config.database, DatabaseConfig::in_memory());
    let plans = config.plans.tiers.len();
    let providers = config.pricing.providers.len();

    let engine = open_engine(config).await;
    engine.close();

    println!("Configuration is valid");
    println!("  database:  {}", database.path);
    println!("  plans:     {}", plans);
    println!("  providers: {}", providers);
}

async fn run_sweep(explicit_config_path: Option<&str>, user: Option<&str>) {
    let config = load_config(explicit_config_path);
    let _tracing_guard = init_observability(&config);
    let engine = open_engine(config).await;

    let result = match user {
        Some(user) => engine.sweep(user).await.map(|report| print_json(&report)),
        None => engine
            .sweep_retention()
            .await
            .map(|retention| print_json(&retention)),
    };
    engine.close();

    if let Err(e) = result {
        tracing::error!(error = %e, "Sweep failed");
        eprintln!("Error: Sweep failed: {}", e);
        std::process::exit(1);
    }
}

async fn run_usage(explicit_config_path: Option<&str>, user: &str, period: Option<&str>) {
    let config = load_config(explicit_config_path);
    let _tracing_guard = init_observability(&config);
    let engine = open_engine(config).await;

    let result = engine.current_usage(user, period).await;
    engine.close();

    match result {
        Ok(summary) => print_json(&summary),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Export the config JSON schema to file or stdout.
#[cfg(feature = "json-schema")]
fn run_schema_export(output: Option<String>) {
    let content = match MeterConfig::json_schema_string() {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Error: Failed to serialize config schema: {}", e);
            std::process::exit(1);
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &content) {
                eprintln!("Failed to write to {}: {}", path, e);
                std::process::exit(1);
            }
            eprintln!("Config JSON schema written to {}", path);
        }
        None => {
            println!("{}", content);
        }
    }
}
