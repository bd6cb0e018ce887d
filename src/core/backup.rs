//! Partition backup and restore
//!
//! Backup reads partitions with `fastboot fetch` while the device is in the
//! bootloader and falls back to `adb pull` of the block device otherwise.
//! Restore writes every image to its bare partition name and reboots only
//! when all of them were written.

use crate::core::archive::{self, ScratchDir, SourceKind};
use crate::core::config::Config;
use crate::core::confirm::{self, ConfirmGate};
use crate::core::error::{FlashError, Precondition, Result};
use crate::core::slot::PartitionOutcome;
use crate::device::detector::DeviceDetector;
use crate::device::record::DeviceMode;
use crate::device::transport::{Backend, Invocation, Transport};
use chrono::Local;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Partitions backed up when none are named
pub const COMMON_PARTITIONS: &[&str] = &[
    "boot", "boot_a", "boot_b", "recovery", "vbmeta", "vbmeta_a", "vbmeta_b", "super", "persist",
    "modem", "bluetooth", "dsp", "cust",
];

/// Where block devices are exposed by name on the phone
const BY_NAME: &str = "/dev/block/by-name";

/// One step of a backup or restore, for progress display
#[derive(Debug, Clone)]
pub struct StepProgress {
    pub step: usize,
    pub total: usize,
    pub partition: String,
}

/// Progress callback type
pub type StepCallback = Arc<dyn Fn(StepProgress) + Send + Sync>;

/// Options for a backup
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Partitions to read; empty means [`COMMON_PARTITIONS`]
    pub partitions: Vec<String>,
    /// Output directory; default is a timestamped directory under `paths.backup_dir`
    pub out_dir: Option<PathBuf>,
    /// Also pack the output directory into `<dir>.tar.gz`
    pub compress: bool,
}

/// A partition image that was saved
#[derive(Debug, Clone, Serialize)]
pub struct SavedImage {
    pub partition: String,
    pub path: PathBuf,
    pub size: u64,
    /// `fastboot` or `adb`
    pub via: String,
}

/// A partition that could not be read
#[derive(Debug, Clone, Serialize)]
pub struct FailedImage {
    pub partition: String,
    pub diagnostics: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub out_dir: PathBuf,
    pub saved: Vec<SavedImage>,
    pub failed: Vec<FailedImage>,
    pub archive: Option<PathBuf>,
}

impl BackupReport {
    pub fn saved_names(&self) -> Vec<&str> {
        self.saved.iter().map(|s| s.partition.as_str()).collect()
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.partition.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub partitions: Vec<PartitionOutcome>,
    pub rebooted: bool,
}

impl RestoreReport {
    pub fn all_succeeded(&self) -> bool {
        self.partitions.iter().all(|p| p.succeeded())
    }
}

/// Default backup directory name, e.g. `backup_20240131_235959`
pub fn timestamped_dir_name() -> String {
    Local::now().format("backup_%Y%m%d_%H%M%S").to_string()
}

fn saved_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Backup and restore over one transport
pub struct BackupManager<'a> {
    transport: &'a dyn Transport,
    config: &'a Config,
    progress_callback: Option<StepCallback>,
    shutdown_flag: Arc<AtomicBool>,
}

impl<'a> BackupManager<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a Config) -> Self {
        Self {
            transport,
            config,
            progress_callback: None,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set progress callback
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(StepProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = flag;
        self
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    fn report(&self, step: usize, total: usize, partition: &str) {
        if let Some(ref callback) = self.progress_callback {
            callback(StepProgress {
                step,
                total,
                partition: partition.to_string(),
            });
        }
    }

    /// Read partitions into a directory. Failures are collected, not fatal.
    pub fn backup(&self, options: &BackupOptions) -> Result<BackupReport> {
        let mode = DeviceDetector::new(self.transport).current_mode();
        if mode == DeviceMode::None {
            return Err(FlashError::precondition(Precondition::NoDevice));
        }

        let out_dir = options
            .out_dir
            .clone()
            .unwrap_or_else(|| self.config.paths.backup_dir().join(timestamped_dir_name()));
        fs::create_dir_all(&out_dir)?;

        let partitions: Vec<String> = if options.partitions.is_empty() {
            COMMON_PARTITIONS.iter().map(|p| p.to_string()).collect()
        } else {
            options.partitions.clone()
        };
        info!("Backing up {} partition(s) to {}", partitions.len(), out_dir.display());

        let mut report = BackupReport {
            out_dir: out_dir.clone(),
            saved: Vec::new(),
            failed: Vec::new(),
            archive: None,
        };

        let total = partitions.len();
        for (index, partition) in partitions.iter().enumerate() {
            if self.is_shutdown_requested() {
                return Err(FlashError::Cancelled(format!(
                    "backup interrupted after {} of {} partitions; partial output in {}",
                    index,
                    total,
                    out_dir.display()
                )));
            }
            self.report(index + 1, total, partition);
            let image = out_dir.join(format!("{}.img", partition));

            match self.read_partition(mode, partition, &image) {
                Ok((size, via)) => {
                    debug!("Saved {} ({} bytes) via {}", partition, size, via);
                    report.saved.push(SavedImage {
                        partition: partition.clone(),
                        path: image,
                        size,
                        via: via.to_string(),
                    });
                }
                Err(diagnostics) => {
                    warn!("Could not back up {}: {}", partition, diagnostics);
                    report.failed.push(FailedImage {
                        partition: partition.clone(),
                        diagnostics,
                    });
                }
            }
        }

        if options.compress && !report.saved.is_empty() {
            info!("Compressing {}", out_dir.display());
            report.archive = Some(archive::compress_dir(&out_dir)?);
        }

        Ok(report)
    }

    /// `fastboot fetch`, then `adb pull` of the block device
    fn read_partition(
        &self,
        mode: DeviceMode,
        partition: &str,
        image: &Path,
    ) -> std::result::Result<(u64, Backend), String> {
        let timeout = self.config.flash.flash_timeout();
        let target = image.display().to_string();
        let mut diagnostics = String::new();

        // fastboot waits for a device rather than failing, so only ask it
        // when the device is actually in the bootloader
        if mode.is_bootloader() {
            let fetch = Invocation::fastboot(["fetch", partition, target.as_str()])
                .with_timeout(timeout);
            match self.transport.run(&fetch) {
                Ok(_) => match saved_size(image) {
                    Some(size) => return Ok((size, Backend::Fastboot)),
                    None => diagnostics = "fetch produced no file".to_string(),
                },
                Err(u) => diagnostics = u.diagnostics(),
            }
        }

        let block = format!("{}/{}", BY_NAME, partition);
        if let Err(u) = self.transport.run(&Invocation::adb(["shell", "ls", block.as_str()])) {
            if diagnostics.is_empty() {
                diagnostics = u.diagnostics();
            }
            return Err(diagnostics);
        }

        let pull = Invocation::adb(["pull", block.as_str(), target.as_str()]).with_timeout(timeout);
        match self.transport.run(&pull) {
            Ok(_) => saved_size(image)
                .map(|size| (size, Backend::Adb))
                .ok_or_else(|| "pull produced no file".to_string()),
            Err(u) => Err(u.diagnostics()),
        }
    }

    /// Write images from a backup directory or `.tar.gz` back to the device
    pub fn restore(
        &self,
        source: &Path,
        filter: &[String],
        gate: &dyn ConfirmGate,
    ) -> Result<RestoreReport> {
        if !source.exists() {
            return Err(FlashError::precondition(Precondition::SourceMissing(
                source.to_path_buf(),
            )));
        }

        let kind = SourceKind::detect(source);
        let scratch = match kind {
            SourceKind::Directory => None,
            SourceKind::TarGz | SourceKind::Zip => {
                let dir = ScratchDir::for_archive(&self.config.paths.scratch_dir(), source)?;
                info!("Extracting {}", source.display());
                archive::extract(source, dir.path(), &mut |_: archive::ExtractProgress| {})?;
                Some(dir)
            }
            SourceKind::File => {
                return Err(FlashError::precondition(Precondition::UnsupportedArchive(
                    archive::display_extension(source),
                )))
            }
        };
        let root = scratch
            .as_ref()
            .map(|d| d.path().to_path_buf())
            .unwrap_or_else(|| source.to_path_buf());

        let images: Vec<PathBuf> = archive::find_images(&root)
            .into_iter()
            .filter(|img| filter.is_empty() || filter.contains(&archive::partition_name(img)))
            .collect();
        if images.is_empty() {
            return Err(FlashError::precondition(Precondition::NoImages(root)));
        }

        match DeviceDetector::new(self.transport).current_mode() {
            mode if mode.is_bootloader() => {}
            DeviceMode::None => return Err(FlashError::precondition(Precondition::NoDevice)),
            actual => {
                return Err(FlashError::precondition(Precondition::WrongMode {
                    required: "fastboot",
                    actual,
                }))
            }
        }

        confirm::require(gate, &format!("restore {} partition(s)", images.len()))?;

        let total = images.len();
        let mut partitions = Vec::with_capacity(total);
        for (index, image) in images.iter().enumerate() {
            if self.is_shutdown_requested() {
                return Err(FlashError::Cancelled(format!(
                    "restore interrupted after {} of {} partitions",
                    index, total
                )));
            }
            let partition = archive::partition_name(image);
            self.report(index + 1, total, &partition);

            let flash = Invocation::fastboot([
                "flash".to_string(),
                partition.clone(),
                image.display().to_string(),
            ])
            .with_timeout(self.config.flash.flash_timeout());
            let result = self.transport.run(&flash).map(|_| ()).map_err(|u| {
                warn!("Restoring {} failed: {}", partition, u.diagnostics());
                u.diagnostics()
            });
            partitions.push(PartitionOutcome::single(&partition, result));
        }
        drop(scratch);

        let mut report = RestoreReport {
            partitions,
            rebooted: false,
        };
        if report.all_succeeded() {
            info!("Restore complete, rebooting");
            report.rebooted = match self.transport.run(&Invocation::fastboot(["reboot"])) {
                Ok(_) => true,
                Err(u) => {
                    warn!("Reboot after restore failed: {}", u.diagnostics());
                    false
                }
            };
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confirm::{Forced, Refuse};
    use crate::testdb::MockTransport;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.backup_dir = dir.join("backups");
        config.paths.scratch_dir = dir.join("scratch");
        config
    }

    /// Write `<args[2]>` the way `fastboot fetch` / `adb pull` would
    fn write_target(inv: &Invocation) {
        fs::write(&inv.args[2], b"partition-bytes").unwrap();
    }

    #[test]
    fn test_timestamped_dir_name() {
        let name = timestamped_dir_name();
        assert!(name.starts_with("backup_"));
        assert_eq!(name.len(), "backup_20240131_235959".len());
    }

    #[test]
    fn test_backup_fetch_in_bootloader() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = MockTransport::new()
            .respond("fastboot devices", "XYZ789\tfastboot\n")
            .on_run("fastboot fetch boot", write_target)
            .fail_with("fastboot fetch modem", "FAILED (remote: 'fetch not supported')")
            .fail("adb shell ls");

        let out = dir.path().join("out");
        let report = BackupManager::new(&mock, &config)
            .backup(&BackupOptions {
                partitions: vec!["boot".to_string(), "modem".to_string()],
                out_dir: Some(out.clone()),
                compress: true,
            })
            .unwrap();

        assert_eq!(report.saved_names(), vec!["boot"]);
        assert_eq!(report.saved[0].via, "fastboot");
        assert_eq!(report.saved[0].size, 15);
        assert_eq!(report.failed_names(), vec!["modem"]);
        assert!(report.failed[0].diagnostics.contains("fetch not supported"));
        assert_eq!(report.archive.as_deref(), Some(dir.path().join("out.tar.gz").as_path()));
        assert!(out.join("boot.img").exists());
    }

    #[test]
    fn test_backup_adb_pull_fallback_in_os_mode() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\nABC123\tdevice\n")
            .fail_with("adb shell ls /dev/block/by-name/cust", "No such file or directory")
            .on_run("adb pull", write_target);

        let report = BackupManager::new(&mock, &config)
            .backup(&BackupOptions {
                partitions: vec!["boot".to_string(), "cust".to_string()],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(report.saved_names(), vec!["boot"]);
        assert_eq!(report.saved[0].via, "adb");
        assert_eq!(report.failed_names(), vec!["cust"]);
        assert_eq!(mock.count("fastboot fetch"), 0);
        assert!(report.out_dir.starts_with(dir.path().join("backups")));
        assert!(report.archive.is_none());
    }

    #[test]
    fn test_backup_command_success_without_file_is_failure() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = MockTransport::new().respond("fastboot devices", "XYZ789\tfastboot\n");

        let report = BackupManager::new(&mock, &config)
            .backup(&BackupOptions {
                partitions: vec!["persist".to_string()],
                out_dir: Some(dir.path().join("out")),
                compress: true,
            })
            .unwrap();

        assert!(report.saved.is_empty());
        assert_eq!(report.failed_names(), vec!["persist"]);
        // Nothing to compress
        assert!(report.archive.is_none());
    }

    #[test]
    fn test_backup_requires_device() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = MockTransport::strict();
        let err = BackupManager::new(&mock, &config)
            .backup(&BackupOptions::default())
            .unwrap_err();
        assert!(err.is_precondition());
    }

    fn backup_dir(root: &Path) -> PathBuf {
        let dir = root.join("backup_20240101_000000");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("boot.img"), "boot").unwrap();
        fs::write(dir.join("vbmeta.img"), "vbmeta").unwrap();
        dir
    }

    #[test]
    fn test_restore_directory_with_filter_and_reboot() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let source = backup_dir(dir.path());
        let mock = MockTransport::new().respond("fastboot devices", "XYZ789\tfastboot\n");

        let report = BackupManager::new(&mock, &config)
            .restore(&source, &["vbmeta".to_string()], &Forced)
            .unwrap();

        assert!(report.all_succeeded());
        assert!(report.rebooted);
        assert_eq!(report.partitions.len(), 1);
        assert_eq!(mock.count("fastboot flash vbmeta"), 1);
        assert_eq!(mock.count("fastboot flash boot"), 0);
    }

    #[test]
    fn test_restore_compressed_backup_cleans_scratch() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let source = backup_dir(dir.path());
        let archive = archive::compress_dir(&source).unwrap();
        let mock = MockTransport::new()
            .respond("fastboot devices", "XYZ789\tfastboot\n")
            .fail("fastboot flash vbmeta");

        let report = BackupManager::new(&mock, &config)
            .restore(&archive, &[], &Forced)
            .unwrap();

        assert!(!report.all_succeeded());
        assert!(!report.rebooted);
        assert_eq!(mock.count("fastboot reboot"), 0);
        assert_eq!(report.partitions.len(), 2);
        assert!(!dir.path().join("scratch").join("backup_20240101_000000").exists());
    }

    #[test]
    fn test_restore_requires_bootloader_and_confirmation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let source = backup_dir(dir.path());

        let adb = MockTransport::new()
            .respond("adb devices", "List of devices attached\nABC123\tdevice\n");
        let err = BackupManager::new(&adb, &config)
            .restore(&source, &[], &Forced)
            .unwrap_err();
        assert!(err.is_precondition());
        assert!(adb.mutating_calls().is_empty());

        let fastboot = MockTransport::new().respond("fastboot devices", "XYZ789\tfastboot\n");
        let err = BackupManager::new(&fastboot, &config)
            .restore(&source, &[], &Refuse)
            .unwrap_err();
        assert!(matches!(err, FlashError::Cancelled(_)));
        assert!(fastboot.mutating_calls().is_empty());
    }

    #[test]
    fn test_restore_rejects_plain_file_and_empty_filter_match() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = MockTransport::new().respond("fastboot devices", "XYZ789\tfastboot\n");

        let plain = dir.path().join("boot.img");
        fs::write(&plain, "boot").unwrap();
        let err = BackupManager::new(&mock, &config)
            .restore(&plain, &[], &Forced)
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::PreconditionFailed(Precondition::UnsupportedArchive(_))
        ));

        let source = backup_dir(dir.path());
        let err = BackupManager::new(&mock, &config)
            .restore(&source, &["modem".to_string()], &Forced)
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::PreconditionFailed(Precondition::NoImages(_))
        ));
    }
}
