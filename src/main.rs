use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use serde_json::Value;

use llm_backend::logging::{setup_logging, setup_worker_logging};
use llm_backend::{build_strategy, BackendController, Pool, PoolSettings};
use llm_backend_config::BackendSettings;
use llm_backend_db::Database;
use llm_backend_types::InstanceConfig;

#[derive(Parser)]
#[command(name = "llm_backend", version, about = "Manage and query LLM instances")]
struct Cli {
    /// JSON settings file; BACKEND_* environment variables still apply
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a new instance configuration and print its id
    Create {
        #[arg(long, default_value = "echo")]
        backend: String,
        #[arg(long, default_value = "lookup")]
        loader: String,
        #[arg(long)]
        model_path: Option<String>,
        #[arg(long)]
        model_version: Option<String>,
        #[arg(long)]
        gateway: Option<String>,
        /// Loader parameter as KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,
    },
    /// List stored instances
    List,
    /// Load an instance and send it one prompt
    Run { instance: String, prompt: String },
    /// Delete an instance
    Delete { instance: String },
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> anyhow::Result<()> {
    // Worker mode must be detected before CLI parsing: stdout belongs to the
    // IPC stream from here on.
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--worker") {
        let level = BackendSettings::load(None)
            .map(|settings| settings.level_filter())
            .unwrap_or(LevelFilter::Info);
        if let Err(e) = setup_worker_logging(level) {
            eprintln!("Failed to initialize worker logging: {e}");
        }
        llm_backend_worker::worker_main::run_worker()?;
        return Ok(());
    }

    let cli = Cli::parse();
    let settings = BackendSettings::load(cli.config.as_deref()).map_err(anyhow::Error::msg)?;

    match setup_logging(&settings.log_directory(), settings.level_filter()) {
        Ok(path) => log::info!("Logging to {}", path.display()),
        Err(e) => eprintln!("Failed to initialize logging: {e}"),
    }

    std::fs::create_dir_all(&settings.working_directory).with_context(|| {
        format!(
            "Failed to create working directory {}",
            settings.working_directory.display()
        )
    })?;
    let db_path = settings.database_path();
    let db = Database::new(&db_path.to_string_lossy()).map_err(anyhow::Error::msg)?;

    let strategy = build_strategy(&settings).context("Failed to set up execution strategy")?;
    let pool = Pool::builtin(strategy, PoolSettings::from(&settings));
    let controller = BackendController::new(pool, Arc::new(db));

    let result = run_command(&controller, cli.command);
    controller.shutdown();
    result
}

fn run_command(controller: &BackendController, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Create {
            backend,
            loader,
            model_path,
            model_version,
            gateway,
            kwargs,
        } => {
            let mut config = InstanceConfig::new(backend, loader);
            config.model_path = model_path;
            config.model_version = model_version;
            config.gateway = gateway;
            config.loader_kwargs.extend(kwargs);

            let id = controller.create_instance(&config)?;
            println!("{id}");
        }
        Command::List => {
            for record in controller.list_instances()? {
                println!("{}\t{}", record.id, record.config.describe());
            }
        }
        Command::Run { instance, prompt } => {
            let output = controller.forward_request(&instance, &prompt)?;
            println!("{output}");
        }
        Command::Delete { instance } => {
            controller.delete_instance(&instance)?;
            println!("Deleted {instance}");
        }
    }
    Ok(())
}
