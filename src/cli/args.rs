//! Command-line argument definitions
//!
//! This module defines all CLI arguments and subcommands using clap.

use crate::core::downloader::ChecksumAlgo;
use crate::core::flash::FlashTarget;
use crate::core::slot::SlotSelector;
use crate::device::reboot::RebootTarget;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Detect, flash, back up and restore Android phones over adb and fastboot
#[derive(Parser, Debug)]
#[command(name = "miflasher")]
#[command(version)]
#[command(about = "Device-mode detection and firmware flashing over adb and fastboot", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace (overrides config)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the connected device (the default when no command is given)
    Device {
        /// Print the device record as JSON
        #[arg(long)]
        json: bool,

        /// Keep polling and report connects, disconnects and mode changes
        #[arg(short, long)]
        watch: bool,

        /// Poll interval in milliseconds (overrides config)
        #[arg(long, requires = "watch")]
        interval: Option<u64>,
    },

    /// Reboot into system, bootloader, recovery, fastbootd or edl
    Reboot {
        /// Boot target
        target: RebootTarget,
    },

    /// Flash firmware from a local path or URL
    ///
    /// Targets: rom (archive or directory, runs flash_all scripts when present),
    /// boot, recovery, vbmeta (single image), super (erase then flash),
    /// payload (payload.bin through an external dumper).
    Flash {
        /// What to flash
        target: FlashTarget,

        /// Local file, directory, .zip, .tgz/.tar.gz, or http(s) URL
        source: String,

        /// Slots to write: all, a or b (overrides config)
        #[arg(long)]
        slot: Option<SlotSelector>,

        /// Use the data-preserving flash script when the ROM has one
        #[arg(long)]
        keep_data: bool,

        /// Do not reboot after a successful flash
        #[arg(long)]
        no_reboot: bool,

        /// Expected digest of a downloaded source
        #[arg(long, value_name = "HEX")]
        checksum: Option<String>,

        /// Digest algorithm of --checksum: sha256 or md5
        #[arg(long, value_name = "ALGO", default_value_t = ChecksumAlgo::Sha256)]
        algo: ChecksumAlgo,
    },

    /// Wipe data, cache and/or the dalvik cache
    Wipe {
        /// Erase userdata (bootloader)
        #[arg(long)]
        data: bool,

        /// Erase cache (bootloader)
        #[arg(long)]
        cache: bool,

        /// Remove the ART cache (adb)
        #[arg(long)]
        dalvik: bool,

        /// All of the above
        #[arg(long)]
        all: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Unlock the bootloader (wipes all user data)
    Unlock {
        /// Token passed to the unlock tool
        #[arg(long)]
        token: Option<String>,

        /// Send `fastboot flashing unlock` instead of running the unlock tool
        #[arg(long)]
        fastboot_only: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Save partition images from the device
    Backup {
        /// Partitions to save (comma-separated; default: common partitions)
        #[arg(short, long, value_delimiter = ',')]
        partitions: Vec<String>,

        /// Output directory (default: timestamped directory under paths.backup_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Also pack the backup into a .tar.gz
        #[arg(long)]
        compress: bool,
    },

    /// Flash a backup directory or .tar.gz back to the device
    Restore {
        /// Backup directory or archive
        path: PathBuf,

        /// Only restore these partitions (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        partitions: Vec<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Download a ROM without flashing it (resumes partial downloads)
    Download {
        /// http(s) URL
        url: String,

        /// Expected digest
        #[arg(long, value_name = "HEX")]
        checksum: Option<String>,

        /// Digest algorithm of --checksum: sha256 or md5
        #[arg(long, value_name = "ALGO", default_value_t = ChecksumAlgo::Sha256)]
        algo: ChecksumAlgo,

        /// Destination directory (default: paths.download_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// File name (default: last URL path segment)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show or edit the configuration file
    ///
    /// The config file is stored at:
    /// - Windows: %APPDATA%\miflasher\config.toml
    /// - Linux: ~/.config/miflasher/config.toml
    ///
    /// A ./miflasher.toml in the current directory takes precedence.
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Browse or clear the per-run session logs (logging.session_dir)
    Logs {
        #[command(subcommand)]
        action: LogsCommands,
    },

    /// Run device scenarios against the scripted transport (no phone needed)
    Simulate {
        /// Scenario names (comma-separated or multiple values); empty runs the quick set
        #[arg(value_delimiter = ',')]
        scenarios: Vec<String>,

        /// List available scenarios and exit
        #[arg(long)]
        list: bool,

        /// Run every scenario
        #[arg(long, conflicts_with = "scenarios")]
        all: bool,

        /// Only scenarios with this tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Stop on first failure
        #[arg(long)]
        fail_fast: bool,

        /// Write test_report.json into this directory
        #[arg(long, value_name = "DIR")]
        report: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print one value by dotted key, e.g. flash.auto_reboot
    Get { key: String },

    /// Set one value by dotted key and save
    Set { key: String, value: String },

    /// Overwrite the config file with defaults
    Reset,

    /// Print the config file path
    Path,

    /// Write a commented default config file
    Generate {
        /// Output path (defaults to the standard location)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogsCommands {
    /// List session files, newest first
    List,

    /// Print the last lines of the newest session
    Tail {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },

    /// Print every entry of one session
    Show {
        /// Session id as shown by `logs list`
        session: String,
    },

    /// Delete every session file
    Clear {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}
