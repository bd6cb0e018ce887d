//! Command handler implementations
//!
//! This module contains the implementation of all CLI commands. Handlers that
//! talk to the phone take `&dyn Transport` so they run the same against the
//! real backends and the scripted transport in [`crate::testdb`].

use crate::cli::args::{Args, Commands, ConfigCommands, LogsCommands};
use crate::cli::progress::{
    format_bytes, format_duration, print_divider, print_error, print_header, print_info,
    print_rows, print_success, print_warning, DownloadBar, FlashStages, StatusSpinner, StepBar,
};
use crate::core::backup::{BackupManager, BackupOptions, BackupReport, RestoreReport};
use crate::core::config::{get_config_path, Config};
use crate::core::confirm::{require, ConfirmGate, Forced, Refuse};
use crate::core::downloader::{Checksum, DownloadPhase, Downloader};
use crate::core::flash::{
    FlashManager, FlashOptions, FlashOutcome, FlashPhase, FlashProgress, FlashSource, FlashTarget,
};
use crate::core::session::{self, SessionEntry};
use crate::core::slot::SlotStatus;
use crate::core::unlock::{self, UnlockOptions};
use crate::core::wipe::{self, WipeReport, WipeTarget};
use crate::device::{
    reboot_device, DeviceDetector, DeviceWatcher, RebootTarget, SystemTransport, Transport,
    WatchConfig, WatchEvent,
};
use crate::testdb::{self, TestRunner, TestRunnerConfig};
use anyhow::{bail, Context, Result};
use dialoguer::Confirm;
use log::{debug, info, warn};
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Run the appropriate command based on CLI arguments
pub fn run_command(args: &Args, config: &Config, shutdown_flag: Arc<AtomicBool>) -> Result<()> {
    match &args.command {
        None => {
            let transport = system_transport(config);
            show_device(&transport, config.device.json)?;
        }
        Some(Commands::Device {
            json,
            watch,
            interval,
        }) => {
            let transport = system_transport(config);
            let json = *json || config.device.json;
            if *watch {
                let interval = interval.unwrap_or(config.device.watch_interval_ms);
                watch_devices(&transport, interval, json, &shutdown_flag);
            } else {
                show_device(&transport, json)?;
            }
        }
        Some(Commands::Reboot { target }) => {
            let transport = system_transport(config);
            reboot(&transport, *target)?;
        }
        Some(Commands::Flash {
            target,
            source,
            slot,
            keep_data,
            no_reboot,
            checksum,
            algo,
        }) => {
            let mut options = FlashOptions::from_config(&config.flash);
            if let Some(slot) = slot {
                options.slot = *slot;
            }
            options.keep_data = *keep_data;
            options.no_reboot = options.no_reboot || *no_reboot;
            options.checksum = checksum.as_ref().map(|d| Checksum::new(*algo, d.as_str()));

            let transport = system_transport(config);
            flash(&transport, config, shutdown_flag, *target, source, &options)?;
        }
        Some(Commands::Wipe {
            data,
            cache,
            dalvik,
            all,
            force,
        }) => {
            let targets = wipe_targets(*data, *cache, *dalvik, *all)?;
            let transport = system_transport(config);
            wipe_device(&transport, &targets, confirm_gate(*force).as_ref())?;
        }
        Some(Commands::Unlock {
            token,
            fastboot_only,
            force,
        }) => {
            let options = UnlockOptions {
                token: token.clone(),
                fastboot_only: *fastboot_only,
            };
            let transport = system_transport(config);
            unlock_bootloader(&transport, config, &options, confirm_gate(*force).as_ref())?;
        }
        Some(Commands::Backup {
            partitions,
            out,
            compress,
        }) => {
            let options = BackupOptions {
                partitions: partitions.clone(),
                out_dir: out.clone(),
                compress: *compress,
            };
            let transport = system_transport(config);
            backup(&transport, config, shutdown_flag, &options)?;
        }
        Some(Commands::Restore {
            path,
            partitions,
            force,
        }) => {
            let transport = system_transport(config);
            restore(
                &transport,
                config,
                shutdown_flag,
                path,
                partitions,
                confirm_gate(*force).as_ref(),
            )?;
        }
        Some(Commands::Download {
            url,
            checksum,
            algo,
            out,
            name,
        }) => {
            let dest_dir = out
                .clone()
                .unwrap_or_else(|| config.paths.download_dir());
            download(
                shutdown_flag,
                url,
                &dest_dir,
                name.as_deref(),
                checksum
                    .as_ref()
                    .map(|d| Checksum::new(*algo, d.as_str()))
                    .as_ref(),
            )?;
        }
        Some(Commands::Config { action }) => {
            let path = args
                .config
                .clone()
                .unwrap_or_else(Config::get_active_config_path);
            handle_config_command(action, config, &path)?;
        }
        Some(Commands::Logs { action }) => {
            let force = matches!(action, LogsCommands::Clear { force: true });
            handle_logs_command(
                action,
                &config.logging.session_dir(),
                confirm_gate(force).as_ref(),
            )?;
        }
        Some(Commands::Simulate {
            scenarios,
            list,
            all,
            tag,
            fail_fast,
            report,
        }) => {
            if *list {
                testdb::print_available_scenarios();
            } else {
                simulate(scenarios, *all, tag.as_deref(), *fail_fast, report.clone())?;
            }
        }
    }

    Ok(())
}

/// Real backends with the configured program names and probe timeout
fn system_transport(config: &Config) -> SystemTransport {
    SystemTransport::new(config.tools.clone()).with_probe_timeout(config.flash.probe_timeout())
}

/// Asks on the terminal before a destructive operation
struct DialoguerGate;

impl ConfirmGate for DialoguerGate {
    fn confirm(&self, action: &str) -> bool {
        match Confirm::new()
            .with_prompt(format!("This will {}. Continue?", action))
            .default(false)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Could not read confirmation: {}", e);
                false
            }
        }
    }
}

/// `--force` skips the prompt; without a terminal there is nobody to ask
fn confirm_gate(force: bool) -> Box<dyn ConfirmGate> {
    if force {
        Box::new(Forced)
    } else if io::stdin().is_terminal() {
        Box::new(DialoguerGate)
    } else {
        Box::new(Refuse)
    }
}

// ============================================================================
// Device info and watch
// ============================================================================

/// Detect the connected device and print it as a table or JSON
pub fn show_device(transport: &dyn Transport, json: bool) -> Result<()> {
    if json {
        let record = DeviceDetector::new(transport).detect();
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let spinner = StatusSpinner::new("Looking for a device (adb, fastboot, usb)...");
    match DeviceDetector::new(transport).detect() {
        Some(record) => {
            spinner.finish_with(&format!("Found {}", record.summary()));
            print_header("Device Information");
            print_rows(&record.rows());
            print_divider();
        }
        None => {
            spinner.finish_with_error("No device detected");
            print_info("Check the cable, USB debugging authorization, and that adb/fastboot are installed.");
        }
    }
    Ok(())
}

/// Poll until Ctrl+C, printing each connect, disconnect and mode change
pub fn watch_devices(transport: &dyn Transport, interval_ms: u64, json: bool, shutdown: &AtomicBool) {
    let config = WatchConfig::default().with_poll_interval(interval_ms);
    if !json {
        print_info(&format!(
            "Watching for devices every {}ms (Ctrl+C to stop)",
            config.poll_interval_ms
        ));
    }

    let mut watcher = DeviceWatcher::new();
    watcher.run(transport, &config, shutdown, |event| {
        if json {
            match serde_json::to_string(&watch_event_json(&event)) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not encode watch event: {}", e),
            }
        } else {
            print_watch_event(&event);
        }
    });
}

fn watch_event_json(event: &WatchEvent) -> serde_json::Value {
    match event {
        WatchEvent::Connected(record) => serde_json::json!({
            "event": "connected",
            "device": record,
        }),
        WatchEvent::Disconnected { serial, mode } => serde_json::json!({
            "event": "disconnected",
            "serial": serial,
            "mode": mode,
        }),
        WatchEvent::Changed {
            from_serial,
            from_mode,
            record,
        } => serde_json::json!({
            "event": "changed",
            "from_serial": from_serial,
            "from_mode": from_mode,
            "device": record,
        }),
    }
}

fn print_watch_event(event: &WatchEvent) {
    let time = chrono::Local::now().format("%H:%M:%S");
    match event {
        WatchEvent::Connected(record) => {
            print_success(&format!("[{}] Connected: {}", time, record.summary()));
        }
        WatchEvent::Disconnected { serial, mode } => {
            print_warning(&format!(
                "[{}] Disconnected: {} [{}]",
                time,
                serial,
                mode.as_str().to_uppercase()
            ));
        }
        WatchEvent::Changed {
            from_serial,
            from_mode,
            record,
        } => {
            print_info(&format!(
                "[{}] {} [{}] -> {}",
                time,
                from_serial,
                from_mode.as_str().to_uppercase(),
                record.summary()
            ));
        }
    }
}

// ============================================================================
// Reboot
// ============================================================================

pub fn reboot(transport: &dyn Transport, target: RebootTarget) -> Result<()> {
    let spinner = StatusSpinner::new(&format!("Rebooting to {}...", target));
    match reboot_device(transport, target) {
        Ok(from) => {
            spinner.finish_with(&format!(
                "Reboot to {} sent (device was in {} mode)",
                target,
                from.as_str()
            ));
            Ok(())
        }
        Err(e) => {
            spinner.finish_with_error(&format!("Reboot to {} failed", target));
            Err(e.into())
        }
    }
}

// ============================================================================
// Flash
// ============================================================================

pub fn flash(
    transport: &dyn Transport,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
    target: FlashTarget,
    source: &str,
    options: &FlashOptions,
) -> Result<()> {
    let source = FlashSource::parse(source);
    print_header(&format!("Flash {}", target));
    print_rows(&[
        ("Source", source.to_string()),
        ("Slot", options.slot.to_string()),
        ("Keep data", options.keep_data.to_string()),
        ("Reboot after", (!options.no_reboot).to_string()),
    ]);
    println!();

    let stages = Arc::new(FlashStages::new());

    let download_stages = stages.clone();
    let downloader = Downloader::with_shutdown_flag(shutdown_flag.clone())?.with_progress(
        move |progress| {
            let message = match (progress.phase, progress.total) {
                (DownloadPhase::Verifying, _) => format!("Verifying {}", progress.file_name),
                (_, Some(total)) => format!(
                    "Downloading {} ({} / {})",
                    progress.file_name,
                    format_bytes(progress.downloaded),
                    format_bytes(total)
                ),
                (_, None) => format!(
                    "Downloading {} ({})",
                    progress.file_name,
                    format_bytes(progress.downloaded)
                ),
            };
            download_stages.update(&FlashProgress {
                phase: FlashPhase::Acquire,
                step: 0,
                total: 0,
                message,
            });
        },
    );

    let flash_stages = stages.clone();
    let manager = FlashManager::new(transport, config)
        .with_fetcher(&downloader)
        .with_shutdown_flag(shutdown_flag)
        .with_progress(move |progress| flash_stages.update(&progress));

    let outcome = match manager.flash(target, &source, options) {
        Ok(outcome) => outcome,
        Err(e) => {
            stages.finish(false);
            return Err(e).with_context(|| format!("flashing {} from {}", target, source));
        }
    };
    stages.finish(outcome.success);

    print_flash_outcome(&outcome);
    outcome.check()?;
    Ok(())
}

fn print_flash_outcome(outcome: &FlashOutcome) {
    if let Some(ref script) = outcome.script {
        let name = script
            .script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| script.script.display().to_string());
        if script.success {
            print_success(&format!("Flash script {} completed", name));
        } else {
            print_error(&format!("Flash script {} failed", name));
        }
    }

    if !outcome.partitions.is_empty() {
        let rows: Vec<(&str, String)> = outcome
            .partitions
            .iter()
            .map(|p| (p.partition.as_str(), partition_status(p.status, &p.succeeded_slots())))
            .collect();
        println!();
        print_rows(&rows);
    }

    println!();
    let duration = format_duration(outcome.duration);
    if outcome.success {
        print_success(&format!("{} flashed in {}", outcome.target, duration));
        if outcome.rebooted {
            print_info("Device is rebooting");
        }
    } else {
        print_error(&format!("{} flash failed after {}", outcome.target, duration));
    }
}

fn partition_status(status: SlotStatus, written: &[String]) -> String {
    match status {
        SlotStatus::Flashed => format!("✓ {}", written.join(", ")),
        SlotStatus::Partial => format!("⚠ partial: {}", written.join(", ")),
        SlotStatus::Failed => "✗ failed".to_string(),
    }
}

// ============================================================================
// Wipe and unlock
// ============================================================================

/// Collect wipe flags into targets; at least one is required
fn wipe_targets(data: bool, cache: bool, dalvik: bool, all: bool) -> Result<Vec<WipeTarget>> {
    if all {
        return Ok(WipeTarget::ALL.to_vec());
    }
    let targets: Vec<WipeTarget> = [
        (data, WipeTarget::Data),
        (cache, WipeTarget::Cache),
        (dalvik, WipeTarget::Dalvik),
    ]
    .into_iter()
    .filter(|(selected, _)| *selected)
    .map(|(_, target)| target)
    .collect();

    if targets.is_empty() {
        bail!("nothing to wipe: pass --data, --cache, --dalvik or --all");
    }
    Ok(targets)
}

pub fn wipe_device(
    transport: &dyn Transport,
    targets: &[WipeTarget],
    gate: &dyn ConfirmGate,
) -> Result<WipeReport> {
    let report = wipe::wipe(transport, targets, gate)?;

    for result in &report.results {
        if result.success {
            print_success(&format!("Wiped {}", result.target));
        } else {
            print_error(&format!("{}: {}", result.target, result.diagnostics));
        }
    }

    if !report.all_succeeded() {
        let failed: Vec<String> = report.failed().iter().map(|t| t.to_string()).collect();
        bail!("wipe failed for: {}", failed.join(", "));
    }
    Ok(report)
}

pub fn unlock_bootloader(
    transport: &dyn Transport,
    config: &Config,
    options: &UnlockOptions,
    gate: &dyn ConfirmGate,
) -> Result<()> {
    let outcome = unlock::unlock(transport, &config.tools, options, gate)?;
    if outcome.is_success() {
        print_success(&outcome.to_string());
        print_info("The device will wipe user data and reboot");
        Ok(())
    } else {
        print_error(&outcome.to_string());
        bail!("{}", outcome)
    }
}

// ============================================================================
// Backup and restore
// ============================================================================

pub fn backup(
    transport: &dyn Transport,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
    options: &BackupOptions,
) -> Result<BackupReport> {
    let bar = Arc::new(StepBar::new(0));
    let progress_bar = bar.clone();
    let manager = BackupManager::new(transport, config)
        .with_shutdown_flag(shutdown_flag)
        .with_progress(move |p| progress_bar.update(p.step, p.total, &p.partition));

    let report = match manager.backup(options) {
        Ok(report) => report,
        Err(e) => {
            bar.finish_with_error("Backup failed");
            return Err(e.into());
        }
    };
    bar.finish(&format!("{} partition(s) saved", report.saved.len()));

    print_header("Backup");
    let rows: Vec<(&str, String)> = report
        .saved
        .iter()
        .map(|s| {
            (
                s.partition.as_str(),
                format!("{} via {}", format_bytes(s.size), s.via),
            )
        })
        .collect();
    print_rows(&rows);
    for failed in &report.failed {
        print_warning(&format!("{}: {}", failed.partition, failed.diagnostics));
    }
    print_divider();
    print_info(&format!("Saved to {}", report.out_dir.display()));
    if let Some(ref archive) = report.archive {
        print_info(&format!("Archive: {}", archive.display()));
    }

    if report.saved.is_empty() {
        bail!(
            "no partitions could be read ({} failed)",
            report.failed_names().join(", ")
        );
    }
    Ok(report)
}

pub fn restore(
    transport: &dyn Transport,
    config: &Config,
    shutdown_flag: Arc<AtomicBool>,
    source: &Path,
    partitions: &[String],
    gate: &dyn ConfirmGate,
) -> Result<RestoreReport> {
    let bar = Arc::new(StepBar::new(0));
    let progress_bar = bar.clone();
    let manager = BackupManager::new(transport, config)
        .with_shutdown_flag(shutdown_flag)
        .with_progress(move |p| progress_bar.update(p.step, p.total, &p.partition));

    let report = match manager.restore(source, partitions, gate) {
        Ok(report) => report,
        Err(e) => {
            bar.finish_with_error("Restore failed");
            return Err(e).with_context(|| format!("restoring {}", source.display()));
        }
    };

    let flashed = report.partitions.iter().filter(|p| p.succeeded()).count();
    if report.all_succeeded() {
        bar.finish(&format!("{} image(s) restored", flashed));
    } else {
        bar.finish_with_error(&format!(
            "{} of {} image(s) restored",
            flashed,
            report.partitions.len()
        ));
    }

    for partition in report.partitions.iter().filter(|p| !p.succeeded()) {
        print_error(&format!("{}: {}", partition.partition, partition.diagnostics));
    }
    if report.rebooted {
        print_info("Device is rebooting");
    }

    if !report.all_succeeded() {
        bail!("restore incomplete; device was not rebooted");
    }
    Ok(report)
}

// ============================================================================
// Download
// ============================================================================

pub fn download(
    shutdown_flag: Arc<AtomicBool>,
    url: &str,
    dest_dir: &Path,
    name: Option<&str>,
    checksum: Option<&Checksum>,
) -> Result<PathBuf> {
    let bar = Arc::new(DownloadBar::new());
    let progress_bar = bar.clone();
    let downloader = Downloader::with_shutdown_flag(shutdown_flag)?
        .with_progress(move |p| progress_bar.update(&p));

    match downloader.download(url, dest_dir, name, checksum) {
        Ok(path) => {
            bar.finish();
            print_success(&format!("Saved {}", path.display()));
            if checksum.is_none() {
                print_info("No checksum given; file was not verified");
            }
            Ok(path)
        }
        Err(e) => {
            bar.finish_with_error("Download failed");
            Err(e.into())
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Handle `config <sub>` against the file at `path`
pub fn handle_config_command(action: &ConfigCommands, config: &Config, path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => show_config(config, path)?,
        ConfigCommands::Get { key } => {
            println!("{}", format_value(&config.get_value(key)?));
        }
        ConfigCommands::Set { key, value } => {
            let mut on_disk = if path.exists() {
                Config::load(path)?
            } else {
                Config::default()
            };
            on_disk.set_value(key, value)?;
            on_disk.save(path)?;
            info!("Set {} = {} in {}", key, value, path.display());
            println!("{} = {}", key, format_value(&on_disk.get_value(key)?));
        }
        ConfigCommands::Reset => {
            write_default_config(path)?;
            info!("Reset configuration at {}", path.display());
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
            if path.exists() {
                debug!("Config file exists at: {}", path.display());
            } else {
                info!("Config file would be created at: {}", path.display());
            }
        }
        ConfigCommands::Generate { output } => {
            let target = match output {
                Some(output) => output.clone(),
                None => get_config_path().context("could not determine the config directory")?,
            };
            write_default_config(&target)?;
            info!("Configuration file: {}", target.display());
            info!("Edit this file, or use 'miflasher config set <key> <value>'.");
        }
    }
    Ok(())
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, Config::generate_default_config())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &Config, path: &Path) -> Result<()> {
    if path.exists() {
        println!("# {}", path.display());
    } else {
        println!("# defaults (no config file at {})", path.display());
    }
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Strings print bare; everything else in TOML syntax
fn format_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Session logs
// ============================================================================

/// Handle `logs <sub>` against the session directory `dir`
pub fn handle_logs_command(
    action: &LogsCommands,
    dir: &Path,
    gate: &dyn ConfirmGate,
) -> Result<()> {
    match action {
        LogsCommands::List => {
            let sessions = session::list_sessions(dir)?;
            if sessions.is_empty() {
                print_info(&format!("No session logs in {}", dir.display()));
                return Ok(());
            }
            print_header("Session Logs");
            for info in &sessions {
                println!(
                    "  {:<24} {:>10}  {}",
                    info.id,
                    format_bytes(info.size),
                    info.path.display()
                );
            }
        }
        LogsCommands::Tail { lines } => match session::tail(dir, *lines)? {
            Some((info, entries)) => {
                print_header(&format!("Log: {}", info.id));
                print_entries(&entries);
            }
            None => print_info(&format!("No session logs in {}", dir.display())),
        },
        LogsCommands::Show { session: id } => {
            let entries = session::show(dir, id)
                .with_context(|| format!("Session not found: {}", id))?;
            print_header(&format!("Log: {}", id));
            print_entries(&entries);
        }
        LogsCommands::Clear { .. } => {
            if session::list_sessions(dir)?.is_empty() {
                print_info("No session logs to clear");
                return Ok(());
            }
            require(gate, "delete every session log")?;
            let removed = session::clear(dir)?;
            print_success(&format!("Removed {} session log(s)", removed));
        }
    }
    Ok(())
}

fn print_entries(entries: &[SessionEntry]) {
    for entry in entries {
        println!("{}", format_entry(entry));
    }
}

/// `[2024-01-31T23:59:59] WARN  message`
fn format_entry(entry: &SessionEntry) -> String {
    let time = entry.time.get(..19).unwrap_or(&entry.time);
    format!(
        "[{}] {:<5} {}",
        time,
        entry.level.to_uppercase(),
        entry.message
    )
}

// ============================================================================
// Simulate
// ============================================================================

/// Run scenarios against the scripted transport
pub fn simulate(
    scenarios: &[String],
    all: bool,
    tag: Option<&str>,
    fail_fast: bool,
    report_dir: Option<PathBuf>,
) -> Result<()> {
    let known = testdb::list_scenario_names();
    let unknown: Vec<&str> = scenarios
        .iter()
        .map(String::as_str)
        .filter(|name| !known.iter().any(|k| k == name))
        .collect();
    if !unknown.is_empty() {
        bail!(
            "unknown scenario(s): {} (see 'miflasher simulate --list')",
            unknown.join(", ")
        );
    }

    let mut runner = TestRunner::with_config(TestRunnerConfig {
        verbose: true,
        fail_fast,
        report_dir,
        ..Default::default()
    });

    let summary = if all {
        runner.run_all()
    } else if let Some(tag) = tag {
        runner.run_by_tag(tag)
    } else if !scenarios.is_empty() {
        let names: Vec<&str> = scenarios.iter().map(String::as_str).collect();
        runner.run_by_names(&names)
    } else {
        runner.run_quick()
    };

    if summary.total == 0 {
        bail!("no scenarios matched");
    }
    if summary.failed > 0 {
        bail!(
            "{} of {} scenario(s) failed: {}",
            summary.failed,
            summary.total,
            summary.failed_scenarios().join(", ")
        );
    }
    Ok(())
}
