//! miflasher - CLI Entry Point
//!
//! Detects Android phones over adb, fastboot and raw USB, and flashes
//! firmware to them.
//!
//! This binary is a thin wrapper around the library, handling argument parsing,
//! logging setup, and command dispatch.

mod cli;
mod core;
mod device;
mod testdb;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, Commands, DualWriter};
use crate::core::config::{expand_home, Config};
use crate::core::session::{SessionLog, SessionLogger};
use env_logger::Builder;
use log::{debug, info, LevelFilter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(ref config_path) = args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Warning: Failed to load config file: {}", e);
                Config::default()
            }
        }
    } else {
        match Config::load_default() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Warning: {}", e);
                Config::default()
            }
        }
    };

    // Apply CLI overrides to config
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    // Set up graceful shutdown handler
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        if shutdown_flag_clone.load(Ordering::SeqCst) {
            // Second Ctrl+C - force exit
            eprintln!("\nForce shutdown requested. Exiting immediately...");
            std::process::exit(1);
        } else {
            shutdown_flag_clone.store(true, Ordering::SeqCst);
            eprintln!("\nShutdown requested. Stopping after the current device command... (Press Ctrl+C again to force quit)");
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    // Initialize logger
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    if config.logging.log_to_file {
        // Set up logging to both console and file
        let log_path = expand_home(&config.logging.log_file);
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        let logger = Builder::new()
            .filter_level(log_level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {} {}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .target(env_logger::Target::Pipe(Box::new(DualWriter {
                console: std::io::stderr(),
                file: log_file,
            })))
            .build();
        install_logger(logger, &args, &config)?;

        info!("Logging to file: {}", log_path.display());
    } else {
        let logger =
            Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level))
                .build();
        install_logger(logger, &args, &config)?;
    }

    debug!("miflasher v{}", env!("CARGO_PKG_VERSION"));

    // Run the command
    cli::run_command(&args, &config, shutdown_flag)?;

    Ok(())
}

/// Install `logger`, wrapped so every record also lands in this run's session file
fn install_logger(logger: env_logger::Logger, args: &Args, config: &Config) -> Result<()> {
    let max_level = logger.filter();
    let browsing_logs = matches!(args.command, Some(Commands::Logs { .. }));

    if config.logging.session_log && !browsing_logs {
        match SessionLog::start(&config.logging.session_dir()) {
            Ok(session) => {
                log::set_boxed_logger(Box::new(SessionLogger::new(logger, session)))
                    .context("Failed to install logger")?;
            }
            Err(e) => {
                eprintln!("Warning: session log disabled: {}", e);
                log::set_boxed_logger(Box::new(logger)).context("Failed to install logger")?;
            }
        }
    } else {
        log::set_boxed_logger(Box::new(logger)).context("Failed to install logger")?;
    }

    log::set_max_level(max_level);
    Ok(())
}
