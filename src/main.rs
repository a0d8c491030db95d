//! Halldyll CLI entrypoint.
//!
//! This is the main entrypoint for the halldyll-provision command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_provision::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use halldyll_provision::config::{
    ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file,
};
use halldyll_provision::engine::Engine;
use halldyll_provision::error::{HalldyllError, Result};
use halldyll_provision::provider::{
    HttpProvider, MemoryProvider, Provider, ProviderAdapter, RetryPolicy,
};
use halldyll_provision::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns `false` when a run completed with failures.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<bool> {
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| true),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, formatter).await,
        Commands::Apply { yes, parallelism } => {
            cmd_apply(config_path, yes, parallelism, formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, formatter).await,
        Commands::Drift => cmd_drift(config_path, false, formatter).await,
        Commands::Refresh => cmd_drift(config_path, true, formatter).await,
        Commands::Outputs => cmd_outputs(config_path, formatter).await,
        Commands::State { command } => cmd_state(config_path, command, formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Halldyll stack in: {}", path.display());

    let config_path = path.join("halldyll.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/halldyll.stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Halldyll")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set the provider token");
    eprintln!("  2. Declare your resources in halldyll.stack.yaml");
    eprintln!("  3. Run 'halldyll-provision validate' to check the stack");
    eprintln!("  4. Run 'halldyll-provision plan' to see what will change");
    eprintln!("  5. Run 'halldyll-provision apply' to provision it");

    Ok(())
}

/// Validate the stack file.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));

    if !formatter.is_json() && result.is_valid() {
        eprintln!("Stack summary:");
        eprintln!("  Project: {}", config.project.name);
        eprintln!("  Environment: {}", config.project.environment);
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Exports: {}", config.exports.len());
    }

    Ok(result.is_valid())
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path).await?;
    let engine = Engine::new(&config, store.as_ref(), create_adapter(&config)?);

    let plan = engine.plan().await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(true)
}

/// Apply the stack.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path).await?;
    let mut engine = Engine::new(&config, store.as_ref(), create_adapter(&config)?);
    if let Some(parallelism) = parallelism {
        engine = engine.with_parallelism(parallelism.max(1));
    }

    let plan = engine.plan().await?;
    if !plan.has_changes() {
        eprintln!("No changes to apply; refreshing exports.");
    } else if !auto_approve {
        eprintln!("{}", formatter.format_plan(&plan, false));
        if !confirm("Do you want to apply this plan?")? {
            eprintln!("Apply cancelled.");
            return Ok(true);
        }
    }

    let report = engine
        .with_cancellation(cancel_on_ctrl_c())
        .apply_approved(&plan)
        .await?;
    println!("{}", formatter.format_run(&report));
    Ok(report.succeeded())
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path).await?;

    if !auto_approve {
        let count = store.load().await?.map_or(0, |s| s.resources.len());
        eprintln!(
            "This will delete {count} resource(s) in {}/{}.",
            config.project.name, config.project.environment
        );
        if !confirm("Are you sure?")? {
            eprintln!("Destroy cancelled.");
            return Ok(true);
        }
    }

    let engine = Engine::new(&config, store.as_ref(), create_adapter(&config)?)
        .with_cancellation(cancel_on_ctrl_c());
    let report = engine.destroy().await?;
    println!("{}", formatter.format_run(&report));
    Ok(report.succeeded())
}

/// Check for drift, optionally writing observations back into state.
async fn cmd_drift(
    config_path: Option<&PathBuf>,
    refresh: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path).await?;
    let engine = Engine::new(&config, store.as_ref(), create_adapter(&config)?);

    let report = if refresh {
        engine.refresh().await?
    } else {
        engine.check_drift().await?
    };
    println!("{}", formatter.format_drift(&report));

    if refresh && report.has_drift() && !formatter.is_json() {
        eprintln!("{}", formatter.success("State refreshed."));
    }
    Ok(true)
}

/// Show exported values.
async fn cmd_outputs(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<bool> {
    let (config, store) = load_config_and_state(config_path).await?;
    let engine = Engine::new(&config, store.as_ref(), create_adapter(&config)?);

    println!("{}", formatter.format_exports(&engine.exports().await?));
    Ok(true)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (_config, store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!("Force-releasing lock {} held by {}", lock.lock_id, lock.holder);
                    store.release_lock(&lock.lock_id).await?;
                    eprintln!("{}", formatter.success("State forcefully unlocked."));
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(false);
            }
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the stack file.
fn base_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads configuration and creates the configured state store.
async fn load_config_and_state(
    config_path: Option<&PathBuf>,
) -> Result<(StackConfig, Box<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let validation = ConfigValidator::new().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || base_dir(&config_file).join(STATE_DIR),
                PathBuf::from,
            );
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| HalldyllError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    Ok((config, store))
}

/// Creates the provider adapter for the stack.
///
/// A stack without a provider endpoint runs against the in-process provider.
fn create_adapter(config: &StackConfig) -> Result<ProviderAdapter> {
    let provider: Arc<dyn Provider> = if config.provider.endpoint.is_some() {
        Arc::new(HttpProvider::from_config(&config.provider)?)
    } else {
        warn!("No provider endpoint configured; using the in-memory provider");
        Arc::new(MemoryProvider::new())
    };

    info!("Using {} provider", provider.name());
    Ok(ProviderAdapter::new(
        provider,
        RetryPolicy::from(&config.engine.retry),
    ))
}

/// Returns a receiver that flips to `true` on the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight steps");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Asks for a yes/no confirmation on stderr.
fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N]: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
