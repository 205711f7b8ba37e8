use clap::{Parser, Subcommand};
use nfbridge::bridge::{Bridge, DecisionChannel, Dispatcher};
use nfbridge::capture::{self, NfQueue};
use nfbridge::config;
use nfbridge::telemetry::init_logging;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "nfbridge")]
#[command(about = "Defers netfilter queue verdicts to an external decision process")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the bridge daemon
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config.toml and print the effective settings
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config {
            action: ConfigAction::Validate { config },
        }) => cmd_config_validate(&config),
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(Path::new("config.toml")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_config(config_path: &Path) -> Result<config::Config, String> {
    // A missing file means "all defaults"
    if !config_path.exists() {
        return Ok(config::Config::default());
    }
    config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))
}

fn cmd_run(config_path: &Path) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let cfg = load_config(config_path)?;
    init_logging(Some(&cfg.logging));

    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        tracing::warn!("{}", warning);
    }
    if validation.has_errors() {
        validation.print_diagnostics();
        return Err("Invalid configuration".to_string());
    }

    info!("nfbridge starting...");

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;
    let bridge = Arc::new(Bridge::new(cfg.verdict.clone()));

    let channel = {
        let _guard = rt.enter();
        DecisionChannel::bind(&cfg.channel)
            .map_err(|e| format!("Failed to bind decision channel: {}", e))?
    };

    let mut queue = NfQueue::open(&cfg.queue).map_err(|e| {
        format!(
            "Failed to open netfilter queue {}: {}. Run with CAP_NET_ADMIN.",
            cfg.queue.num, e
        )
    })?;

    rt.spawn(watch_signals(bridge.clone()));
    let dispatcher = rt.spawn(Dispatcher::new(bridge.clone(), channel).run());

    info!(
        "bridging queue {} to {}",
        cfg.queue.num,
        cfg.channel.socket_path.display()
    );

    // Kernel-facing side runs on this thread
    let served = capture::serve(&mut queue, &bridge);

    bridge.liveness().shutdown();
    let dispatched = rt
        .block_on(dispatcher)
        .map_err(|e| format!("Dispatcher task failed: {}", e))?;
    bridge.shutdown();
    drop(queue);

    for (name, value) in bridge.metrics().export() {
        info!("{} = {}", name, value);
    }
    info!("nfbridge stopped");

    served.map_err(|e| format!("Receive loop failed: {}", e))?;
    dispatched.map_err(|e| format!("Dispatcher failed: {}", e))
}

/// Clear the liveness flag on SIGINT or SIGTERM
async fn watch_signals(bridge: Arc<Bridge>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = terminate.recv() => info!("SIGTERM received"),
        _ = bridge.liveness().stopped() => return,
    }

    bridge.liveness().shutdown();
}

fn cmd_config_validate(config_path: &Path) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }

    println!("[INFO] Configuration is valid");
    println!("[INFO]   queue {} (copy_range {})", cfg.queue.num, cfg.queue.copy_range);
    println!("[INFO]   channel {}", cfg.channel.socket_path.display());
    match cfg.verdict.timeout() {
        Some(timeout) => println!(
            "[INFO]   verdict timeout {:?}, fallback {}",
            timeout,
            cfg.verdict.fallback_verdict()
        ),
        None => println!("[INFO]   verdict timeout disabled"),
    }
    Ok(())
}
