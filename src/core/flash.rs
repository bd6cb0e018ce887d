//! Flash dispatcher
//!
//! Every flash runs the same sequence: validate the device mode, acquire the
//! source (downloading when it is a URL), expand archives into a scratch
//! directory, run the target's strategy, remove the scratch directory, and
//! reboot only after a fully successful flash.
//!
//! Nothing that can change device state is sent before validation and
//! acquisition have both succeeded.

use crate::core::archive::{self, ExtractProgress, ScratchDir, SourceKind};
use crate::core::config::{expand_home, Config, FlashConfig};
use crate::core::downloader::{is_remote, Checksum, Fetcher};
use crate::core::error::{FlashError, Precondition, Result};
use crate::core::slot::{flash_partition, PartitionOutcome, SlotSelector};
use crate::device::detector::DeviceDetector;
use crate::device::record::DeviceMode;
use crate::device::transport::{Invocation, Transport};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt::{self, Display};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Vendor scripts that flash everything, in preference order
pub const FULL_FLASH_SCRIPTS: &[&str] = &["flash_all.sh", "flash_all_lock.sh"];

/// Vendor script that leaves user data in place
pub const KEEP_DATA_SCRIPTS: &[&str] = &["flash_all_except_data_storage.sh"];

/// OTA payload container file name
pub const PAYLOAD_FILE: &str = "payload.bin";

pub const PAYLOAD_INSTALL_HINT: &str =
    "Install: pip install payload-dumper-go --break-system-packages";

/// How deep to look for a flashing script inside an extracted ROM
const SCRIPT_SEARCH_DEPTH: usize = 3;

/// What is being flashed; selects the strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashTarget {
    Rom,
    Boot,
    Recovery,
    Vbmeta,
    Super,
    Payload,
}

impl FlashTarget {
    pub const ALL: [FlashTarget; 6] = [
        FlashTarget::Rom,
        FlashTarget::Boot,
        FlashTarget::Recovery,
        FlashTarget::Vbmeta,
        FlashTarget::Super,
        FlashTarget::Payload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlashTarget::Rom => "rom",
            FlashTarget::Boot => "boot",
            FlashTarget::Recovery => "recovery",
            FlashTarget::Vbmeta => "vbmeta",
            FlashTarget::Super => "super",
            FlashTarget::Payload => "payload",
        }
    }

    /// Fixed partition for single-image targets
    pub fn partition(&self) -> Option<&'static str> {
        match self {
            FlashTarget::Boot => Some("boot"),
            FlashTarget::Recovery => Some("recovery"),
            FlashTarget::Vbmeta => Some("vbmeta"),
            FlashTarget::Super => Some("super"),
            FlashTarget::Rom | FlashTarget::Payload => None,
        }
    }
}

impl Display for FlashTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlashTarget {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        FlashTarget::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FlashError::UnknownTarget {
                kind: "flash",
                name: s.to_string(),
                expected: "rom, boot, recovery, vbmeta, super, payload",
            })
    }
}

/// Per-invocation flash options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashOptions {
    pub slot: SlotSelector,
    /// Prefer the data-preserving vendor script
    pub keep_data: bool,
    /// Suppress the reboot after a successful flash
    pub no_reboot: bool,
    /// Expected digest of a downloaded source
    pub checksum: Option<Checksum>,
}

impl FlashOptions {
    /// Defaults taken from the `[flash]` config section
    pub fn from_config(config: &FlashConfig) -> Self {
        Self {
            slot: config.slot,
            no_reboot: !config.auto_reboot,
            ..Default::default()
        }
    }
}

/// Where the image data comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashSource {
    Local(PathBuf),
    Remote(String),
}

impl FlashSource {
    /// URLs become `Remote`, anything else a local path (with `~` expanded)
    pub fn parse(source: &str) -> Self {
        if is_remote(source) {
            FlashSource::Remote(source.to_string())
        } else {
            FlashSource::Local(expand_home(Path::new(source)))
        }
    }
}

impl Display for FlashSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashSource::Local(path) => write!(f, "{}", path.display()),
            FlashSource::Remote(url) => f.write_str(url),
        }
    }
}

/// Stage of the flash sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Validate,
    Acquire,
    Extract,
    Execute,
    Cleanup,
    Reboot,
}

/// Progress update information
#[derive(Debug, Clone)]
pub struct FlashProgress {
    pub phase: FlashPhase,
    /// 1-based step within the phase (0 when not counted)
    pub step: usize,
    /// Step count when known, else 0
    pub total: usize,
    pub message: String,
}

/// Progress callback type
pub type FlashCallback = Arc<dyn Fn(FlashProgress) + Send + Sync>;

/// Result of running a vendor flashing script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptRun {
    pub script: PathBuf,
    pub success: bool,
    pub diagnostics: String,
}

/// Result of one flash invocation
#[derive(Debug, Clone, Serialize)]
pub struct FlashOutcome {
    pub target: FlashTarget,
    /// True only when every partition (or the script) succeeded
    pub success: bool,
    pub duration: Duration,
    /// Per-partition results in the order they were flashed
    pub partitions: Vec<PartitionOutcome>,
    /// Set when the ROM strategy ran a vendor script
    pub script: Option<ScriptRun>,
    pub rebooted: bool,
}

impl FlashOutcome {
    /// Turn a failed outcome into the matching error.
    ///
    /// Some slots written and others not is a `PartialFailure`; nothing
    /// written (or a failing script) is `CommandFailed`.
    pub fn check(&self) -> Result<()> {
        if self.success {
            return Ok(());
        }
        if let Some(ref script) = self.script {
            return Err(FlashError::CommandFailed {
                command: script.script.display().to_string(),
                diagnostics: script.diagnostics.clone(),
            });
        }

        let succeeded: Vec<String> = self
            .partitions
            .iter()
            .flat_map(|p| p.succeeded_slots())
            .collect();
        let failed: Vec<String> = self
            .partitions
            .iter()
            .flat_map(|p| p.failed_slots())
            .collect();

        if succeeded.is_empty() {
            let diagnostics = self
                .partitions
                .iter()
                .filter(|p| !p.diagnostics.is_empty())
                .map(|p| p.diagnostics.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            Err(FlashError::CommandFailed {
                command: format!("fastboot flash {}", failed.join(", ")),
                diagnostics,
            })
        } else {
            Err(FlashError::PartialFailure { succeeded, failed })
        }
    }
}

struct Execution {
    partitions: Vec<PartitionOutcome>,
    script: Option<ScriptRun>,
}

impl Execution {
    fn partitions(partitions: Vec<PartitionOutcome>) -> Self {
        Self {
            partitions,
            script: None,
        }
    }

    fn succeeded(&self) -> bool {
        match self.script {
            Some(ref script) => script.success,
            None => !self.partitions.is_empty() && self.partitions.iter().all(|p| p.succeeded()),
        }
    }
}

/// Locate a vendor flashing script under `root`, shallowest match first
pub fn find_flash_script(root: &Path, keep_data: bool) -> Option<PathBuf> {
    let candidates = if keep_data {
        KEEP_DATA_SCRIPTS
    } else {
        FULL_FLASH_SCRIPTS
    };
    let entries: Vec<_> = WalkDir::new(root)
        .max_depth(SCRIPT_SEARCH_DEPTH)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    candidates.iter().find_map(|name| {
        entries
            .iter()
            .filter(|e| e.file_name().to_string_lossy() == *name)
            .min_by_key(|e| e.depth())
            .map(|e| e.path().to_path_buf())
    })
}

/// Arguments for a payload dumper; the Python tool spells the output flag
/// differently from the Go one
fn dumper_args(tool: &str, out_dir: &Path, payload: &Path) -> Vec<String> {
    let out_flag = match Path::new(tool).file_name().and_then(|n| n.to_str()) {
        Some("payload_dumper") => "--out",
        _ => "-o",
    };
    vec![
        out_flag.to_string(),
        out_dir.display().to_string(),
        payload.display().to_string(),
    ]
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Orchestrates flash operations against one transport
pub struct FlashManager<'a> {
    transport: &'a dyn Transport,
    config: &'a Config,
    fetcher: Option<&'a dyn Fetcher>,
    progress_callback: Option<FlashCallback>,
    shutdown_flag: Arc<AtomicBool>,
}

impl<'a> FlashManager<'a> {
    pub fn new(transport: &'a dyn Transport, config: &'a Config) -> Self {
        Self {
            transport,
            config,
            fetcher: None,
            progress_callback: None,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Downloader used for URL sources
    pub fn with_fetcher(mut self, fetcher: &'a dyn Fetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Set progress callback
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(FlashProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    /// Share the application's shutdown flag
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = flag;
        self
    }

    /// Request shutdown; honoured before the next device command
    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.is_shutdown_requested() {
            Err(FlashError::Cancelled(
                "flash interrupted between commands; device left as the last command left it"
                    .to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn report(&self, phase: FlashPhase, step: usize, total: usize, message: impl Into<String>) {
        if let Some(ref callback) = self.progress_callback {
            callback(FlashProgress {
                phase,
                step,
                total,
                message: message.into(),
            });
        }
    }

    fn flash_timeout(&self) -> Duration {
        self.config.flash.flash_timeout()
    }

    /// Flash `target` from `source`
    pub fn flash(
        &self,
        target: FlashTarget,
        source: &FlashSource,
        options: &FlashOptions,
    ) -> Result<FlashOutcome> {
        let started = Instant::now();
        info!("Flash -> {} from {}", target, source);

        self.report(FlashPhase::Validate, 0, 0, "Checking device mode");
        let mode = self.validate()?;
        debug!("Device is in {} mode", mode);

        let local = self.acquire(source, options)?;
        let kind = SourceKind::detect(&local);
        self.check_source(target, &local, kind)?;

        let scratch = if kind.is_archive() {
            let dir = ScratchDir::for_archive(&self.config.paths.scratch_dir(), &local)?;
            self.report(
                FlashPhase::Extract,
                0,
                0,
                format!("Extracting {}", local.display()),
            );
            let mut on_member = |p: ExtractProgress| {
                self.report(FlashPhase::Extract, p.current, p.total, p.name);
            };
            archive::extract(&local, dir.path(), &mut on_member)?;
            Some(dir)
        } else {
            None
        };

        let root = scratch
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
            .unwrap_or_else(|| local.clone());
        let result = self.execute(target, &root, options);

        if scratch.is_some() {
            self.report(FlashPhase::Cleanup, 0, 0, "Removing extracted files");
        }
        drop(scratch);

        let execution = result?;
        let success = execution.succeeded();
        let rebooted = success && !options.no_reboot && self.reboot_after_flash();

        let outcome = FlashOutcome {
            target,
            success,
            duration: started.elapsed(),
            partitions: execution.partitions,
            script: execution.script,
            rebooted,
        };

        if success {
            info!("Flash complete in {:.1}s", outcome.duration.as_secs_f64());
        } else {
            warn!("Flash FAILED after {:.1}s", outcome.duration.as_secs_f64());
        }
        Ok(outcome)
    }

    /// Every flash target needs the bootloader backend
    fn validate(&self) -> Result<DeviceMode> {
        match DeviceDetector::new(self.transport).current_mode() {
            mode if mode.is_bootloader() => Ok(mode),
            DeviceMode::None => Err(FlashError::precondition(Precondition::NoDevice)),
            actual => Err(FlashError::precondition(Precondition::WrongMode {
                required: "fastboot",
                actual,
            })),
        }
    }

    fn acquire(&self, source: &FlashSource, options: &FlashOptions) -> Result<PathBuf> {
        match source {
            FlashSource::Local(path) => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(FlashError::precondition(Precondition::SourceMissing(
                        path.clone(),
                    )))
                }
            }
            FlashSource::Remote(url) => {
                let fetcher = self.fetcher.ok_or_else(|| {
                    FlashError::Download(format!("no downloader available for {}", url))
                })?;
                self.report(FlashPhase::Acquire, 0, 0, format!("Downloading {}", url));
                let checksum = options
                    .checksum
                    .as_ref()
                    .filter(|_| self.config.flash.auto_verify);
                fetcher.fetch(url, &self.config.paths.download_dir(), checksum)
            }
        }
    }

    /// Reject sources the target cannot use before anything is extracted
    fn check_source(&self, target: FlashTarget, local: &Path, kind: SourceKind) -> Result<()> {
        if kind != SourceKind::File {
            return Ok(());
        }
        let acceptable = match target {
            FlashTarget::Rom => false,
            FlashTarget::Payload => has_extension(local, "bin"),
            _ => has_extension(local, "img"),
        };
        if acceptable {
            Ok(())
        } else {
            Err(FlashError::precondition(Precondition::UnsupportedArchive(
                archive::display_extension(local),
            )))
        }
    }

    fn execute(&self, target: FlashTarget, root: &Path, options: &FlashOptions) -> Result<Execution> {
        match target {
            FlashTarget::Rom => self.flash_rom(root, options),
            FlashTarget::Super => self.flash_super(root),
            FlashTarget::Payload => self.flash_payload(root, options.slot),
            FlashTarget::Boot | FlashTarget::Recovery | FlashTarget::Vbmeta => {
                let partition = target.as_str();
                let image = self.locate_image(root, partition)?;
                self.check_cancel()?;
                self.report(
                    FlashPhase::Execute,
                    1,
                    1,
                    format!("Flashing {} ({} slots)", partition, options.slot),
                );
                let outcome = flash_partition(
                    self.transport,
                    partition,
                    &image,
                    options.slot,
                    self.flash_timeout(),
                );
                Ok(Execution::partitions(vec![outcome]))
            }
        }
    }

    /// The image file itself, or `<partition>.img` somewhere under a directory
    fn locate_image(&self, root: &Path, partition: &str) -> Result<PathBuf> {
        if root.is_file() {
            return Ok(root.to_path_buf());
        }
        archive::find_images(root)
            .into_iter()
            .find(|image| archive::partition_name(image) == partition)
            .ok_or_else(|| FlashError::precondition(Precondition::NoImages(root.to_path_buf())))
    }

    fn flash_rom(&self, root: &Path, options: &FlashOptions) -> Result<Execution> {
        let Some(script) = find_flash_script(root, options.keep_data) else {
            info!("No flash script found, flashing images manually via fastboot");
            return self.flash_image_dir(root, options.slot);
        };

        self.check_cancel()?;
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.report(FlashPhase::Execute, 1, 1, format!("Running {}", name));

        // The shell runs inside the script's directory, so it gets the bare file name
        let dir = fs::canonicalize(script.parent().unwrap_or(root))?;
        let script = dir.join(&name);
        let invocation = Invocation::external(&self.config.tools.shell, [name.clone()])
            .in_dir(dir.clone())
            .with_timeout(self.config.flash.script_timeout());

        let run = match self.transport.run(&invocation) {
            Ok(_) => ScriptRun {
                script,
                success: true,
                diagnostics: String::new(),
            },
            Err(u) => {
                warn!("{} failed: {}", name, u.diagnostics());
                ScriptRun {
                    script,
                    success: false,
                    diagnostics: u.diagnostics(),
                }
            }
        };

        Ok(Execution {
            partitions: Vec::new(),
            script: Some(run),
        })
    }

    /// Flash every image under `dir` by inferred partition name.
    ///
    /// A failing image does not stop the remaining ones.
    fn flash_image_dir(&self, dir: &Path, slot: SlotSelector) -> Result<Execution> {
        let images = archive::find_images(dir);
        if images.is_empty() {
            return Err(FlashError::precondition(Precondition::NoImages(
                dir.to_path_buf(),
            )));
        }

        info!("Found {} image(s) to flash", images.len());
        let total = images.len();
        let mut partitions = Vec::with_capacity(total);

        for (index, image) in images.iter().enumerate() {
            if self.is_shutdown_requested() {
                return Err(FlashError::Cancelled(format!(
                    "flash interrupted after {} of {} images",
                    index, total
                )));
            }
            let partition = archive::partition_name(image);
            self.report(
                FlashPhase::Execute,
                index + 1,
                total,
                format!("Flashing {}.img", partition),
            );
            partitions.push(flash_partition(
                self.transport,
                &partition,
                image,
                slot,
                self.flash_timeout(),
            ));
        }

        Ok(Execution::partitions(partitions))
    }

    /// Erase then flash; an erase failure is logged and ignored
    fn flash_super(&self, root: &Path) -> Result<Execution> {
        let image = self.locate_image(root, "super")?;
        self.check_cancel()?;

        self.report(FlashPhase::Execute, 1, 2, "Erasing super partition");
        let erase = Invocation::fastboot(["erase", "super"]).with_timeout(self.flash_timeout());
        if let Err(u) = self.transport.run(&erase) {
            warn!("Erasing super failed, flashing anyway: {}", u.diagnostics());
        }

        self.check_cancel()?;
        self.report(FlashPhase::Execute, 2, 2, "Flashing super.img");
        let flash = Invocation::fastboot([
            "flash".to_string(),
            "super".to_string(),
            image.display().to_string(),
        ])
        .with_timeout(self.flash_timeout());
        let result = self
            .transport
            .run(&flash)
            .map(|_| ())
            .map_err(|u| u.diagnostics());

        Ok(Execution::partitions(vec![PartitionOutcome::single(
            "super", result,
        )]))
    }

    fn flash_payload(&self, root: &Path, slot: SlotSelector) -> Result<Execution> {
        let payload = if root.is_file() {
            root.to_path_buf()
        } else {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .find(|e| e.file_type().is_file() && e.file_name() == PAYLOAD_FILE)
                .map(|e| e.into_path())
                .ok_or_else(|| {
                    FlashError::precondition(Precondition::SourceMissing(root.join(PAYLOAD_FILE)))
                })?
        };

        let candidates = &self.config.tools.payload_dumpers;
        let tool = candidates
            .iter()
            .find(|tool| self.transport.is_installed(tool))
            .ok_or_else(|| {
                FlashError::precondition(Precondition::ToolMissing {
                    candidates: candidates.clone(),
                    hint: PAYLOAD_INSTALL_HINT.to_string(),
                })
            })?;

        let out = ScratchDir::unique(&self.config.paths.scratch_dir(), "payload_out")?;
        self.report(
            FlashPhase::Extract,
            1,
            2,
            format!("Extracting payload with {}", tool),
        );
        let invocation = Invocation::external(tool, dumper_args(tool, out.path(), &payload))
            .with_timeout(self.config.flash.script_timeout());
        self.transport.run(&invocation)?;

        self.report(FlashPhase::Execute, 2, 2, "Flashing extracted images");
        self.flash_image_dir(out.path(), slot)
    }

    fn reboot_after_flash(&self) -> bool {
        self.report(FlashPhase::Reboot, 0, 0, "Rebooting device");
        match self.transport.run(&Invocation::fastboot(["reboot"])) {
            Ok(_) => true,
            Err(u) => {
                warn!("Reboot after flash failed: {}", u.diagnostics());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::test_support::write_zip;
    use crate::core::downloader::{file_name_from_url, ChecksumAlgo};
    use crate::device::transport::SystemTransport;
    use crate::testdb::MockTransport;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const FASTBOOT_XYZ: &str = "XYZ789\tfastboot\n";

    fn fastboot_device() -> MockTransport {
        MockTransport::new().respond("fastboot devices", FASTBOOT_XYZ)
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.scratch_dir = dir.join("scratch");
        config.paths.download_dir = dir.join("downloads");
        config
    }

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    fn flash_lines(mock: &MockTransport) -> Vec<String> {
        mock.mutating_calls()
            .iter()
            .map(|inv| {
                let words = inv.words();
                let keep = if inv.program.label() == "fastboot" { 3 } else { 2 };
                words[..words.len().min(keep)].join(" ")
            })
            .collect()
    }

    struct StubFetcher {
        body: Option<&'static str>,
    }

    impl Fetcher for StubFetcher {
        fn fetch(
            &self,
            url: &str,
            dest_dir: &Path,
            _checksum: Option<&Checksum>,
        ) -> Result<PathBuf> {
            match self.body {
                Some(body) => {
                    fs::create_dir_all(dest_dir)?;
                    let path = dest_dir.join(file_name_from_url(url));
                    fs::write(&path, body)?;
                    Ok(path)
                }
                None => Err(FlashError::Download(format!("{}: HTTP 404", url))),
            }
        }
    }

    #[test]
    fn test_parse_targets() {
        assert_eq!("Super".parse::<FlashTarget>().unwrap(), FlashTarget::Super);
        assert_eq!(FlashTarget::Vbmeta.partition(), Some("vbmeta"));
        assert_eq!(FlashTarget::Rom.partition(), None);
        let err = "modem".parse::<FlashTarget>().unwrap_err();
        assert!(matches!(err, FlashError::UnknownTarget { kind: "flash", .. }));
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(
            FlashSource::parse("https://example.com/rom.tgz"),
            FlashSource::Remote("https://example.com/rom.tgz".to_string())
        );
        assert_eq!(
            FlashSource::parse("/tmp/boot.img"),
            FlashSource::Local(PathBuf::from("/tmp/boot.img"))
        );
    }

    #[test]
    fn test_options_from_config() {
        let mut config = FlashConfig::default();
        config.slot = SlotSelector::B;
        config.auto_reboot = false;
        let options = FlashOptions::from_config(&config);
        assert_eq!(options.slot, SlotSelector::B);
        assert!(options.no_reboot);
        assert!(!options.keep_data);
    }

    #[test]
    fn test_wrong_mode_refuses_every_target_without_mutation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let image = write_file(dir.path(), "boot.img", "img");

        for target in FlashTarget::ALL {
            let mock = MockTransport::new()
                .respond("adb devices", "List of devices attached\nABC123\tdevice\n");
            let err = FlashManager::new(&mock, &config)
                .flash(target, &FlashSource::Local(image.clone()), &FlashOptions::default())
                .unwrap_err();
            match err {
                FlashError::PreconditionFailed(Precondition::WrongMode { required, actual }) => {
                    assert_eq!(required, "fastboot");
                    assert_eq!(actual, DeviceMode::Adb);
                }
                other => panic!("{}: unexpected {:?}", target, other),
            }
            assert!(mock.mutating_calls().is_empty(), "{} mutated", target);
        }
    }

    #[test]
    fn test_no_device_is_precondition() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = MockTransport::strict();
        let err = FlashManager::new(&mock, &config)
            .flash(
                FlashTarget::Boot,
                &FlashSource::Local(dir.path().join("boot.img")),
                &FlashOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::PreconditionFailed(Precondition::NoDevice)
        ));
    }

    #[test]
    fn test_missing_source_is_precondition() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = fastboot_device();
        let err = FlashManager::new(&mock, &config)
            .flash(
                FlashTarget::Boot,
                &FlashSource::Local(dir.path().join("nope.img")),
                &FlashOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlashError::PreconditionFailed(Precondition::SourceMissing(_))
        ));
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_boot_flashes_both_slots_then_reboots() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let image = write_file(dir.path(), "boot.img", "img");
        let mock = fastboot_device();

        let steps = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&steps);
        let outcome = FlashManager::new(&mock, &config)
            .with_progress(move |p| seen.lock().unwrap().push(p.phase))
            .flash(FlashTarget::Boot, &FlashSource::Local(image), &FlashOptions::default())
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.rebooted);
        assert!(outcome.check().is_ok());
        assert_eq!(outcome.partitions[0].tried_names(), vec!["boot_a", "boot_b"]);
        assert_eq!(
            flash_lines(&mock),
            vec!["fastboot flash boot_a", "fastboot flash boot_b", "fastboot reboot"]
        );
        let steps = steps.lock().unwrap();
        assert_eq!(steps.first(), Some(&FlashPhase::Validate));
        assert_eq!(steps.last(), Some(&FlashPhase::Reboot));
    }

    #[test]
    fn test_fastbootd_is_accepted() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let image = write_file(dir.path(), "vbmeta.img", "img");
        let mock = fastboot_device().respond_stderr("fastboot getvar is-userspace", "is-userspace: yes\n");
        let outcome = FlashManager::new(&mock, &config)
            .flash(
                FlashTarget::Vbmeta,
                &FlashSource::Local(image),
                &FlashOptions {
                    slot: SlotSelector::A,
                    no_reboot: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(outcome.success);
        assert!(!outcome.rebooted);
        assert_eq!(flash_lines(&mock), vec!["fastboot flash vbmeta_a"]);
    }

    #[test]
    fn test_partial_slot_failure_blocks_reboot() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let image = write_file(dir.path(), "boot.img", "img");
        let mock = fastboot_device()
            .fail("fastboot flash boot_b")
            .fail("fastboot flash boot");

        let outcome = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Boot, &FlashSource::Local(image), &FlashOptions::default())
            .unwrap();

        assert!(!outcome.success);
        assert!(!outcome.rebooted);
        assert_eq!(mock.count("fastboot reboot"), 0);
        assert_eq!(
            outcome.partitions[0].tried_names(),
            vec!["boot_a", "boot_b", "boot"]
        );
        match outcome.check().unwrap_err() {
            FlashError::PartialFailure { succeeded, failed } => {
                assert_eq!(succeeded, vec!["boot_a"]);
                assert_eq!(failed, vec!["boot_b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_super_erase_failure_does_not_block_flash() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let image = write_file(dir.path(), "super.img", "img");
        let mock = fastboot_device().fail_with("fastboot erase super", "FAILED (remote: 'erase not allowed')");

        let outcome = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Super, &FlashSource::Local(image), &FlashOptions::default())
            .unwrap();

        assert!(outcome.success);
        assert_eq!(
            flash_lines(&mock),
            vec!["fastboot erase super", "fastboot flash super", "fastboot reboot"]
        );
    }

    #[test]
    fn test_rom_archive_manual_flash_and_cleanup_on_failure() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let rom = dir.path().join("ruby_global.zip");
        write_zip(
            &rom,
            &[("images/boot.img", "boot"), ("images/system.img", "system")],
        );
        let mock = fastboot_device()
            .fail("fastboot flash system_a")
            .fail("fastboot flash system_b")
            .fail("fastboot flash system");

        let outcome = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Rom, &FlashSource::Local(rom), &FlashOptions::default())
            .unwrap();

        assert!(!outcome.success);
        assert!(!outcome.rebooted);
        assert_eq!(outcome.partitions.len(), 2);
        assert!(outcome.partitions[0].succeeded());
        assert_eq!(outcome.partitions[1].partition, "system");
        assert!(!dir.path().join("scratch").join("ruby_global").exists());
    }

    #[test]
    fn test_scratch_removed_when_strategy_errors() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let rom = dir.path().join("empty.zip");
        write_zip(&rom, &[("README.txt", "no images here")]);
        let mock = fastboot_device();

        let err = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Rom, &FlashSource::Local(rom), &FlashOptions::default())
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::PreconditionFailed(Precondition::NoImages(_))
        ));
        assert!(!dir.path().join("scratch").join("empty").exists());
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_find_flash_script_prefers_requested_variant() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "ruby/flash_all.sh", "#!/bin/sh");
        write_file(dir.path(), "ruby/flash_all_lock.sh", "#!/bin/sh");
        write_file(dir.path(), "ruby/flash_all_except_data_storage.sh", "#!/bin/sh");

        let full = find_flash_script(dir.path(), false).unwrap();
        assert!(full.ends_with("ruby/flash_all.sh"));
        let keep = find_flash_script(dir.path(), true).unwrap();
        assert!(keep.ends_with("ruby/flash_all_except_data_storage.sh"));

        let bare = TempDir::new().unwrap();
        write_file(bare.path(), "images/boot.img", "img");
        assert!(find_flash_script(bare.path(), false).is_none());
    }

    #[test]
    fn test_rom_script_runs_in_its_directory() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let rom_dir = dir.path().join("rom");
        let script = write_file(&rom_dir, "ruby/flash_all_except_data_storage.sh", "#!/bin/sh");
        write_file(&rom_dir, "ruby/images/boot.img", "img");
        let mock = fastboot_device();

        let outcome = FlashManager::new(&mock, &config)
            .flash(
                FlashTarget::Rom,
                &FlashSource::Local(rom_dir.clone()),
                &FlashOptions {
                    keep_data: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.partitions.is_empty());
        let run = mock
            .calls()
            .into_iter()
            .find(|inv| inv.program.label() == "bash")
            .unwrap();
        assert_eq!(run.args, vec!["flash_all_except_data_storage.sh".to_string()]);
        let script_dir = fs::canonicalize(script.parent().unwrap()).unwrap();
        assert_eq!(run.cwd.as_deref(), Some(script_dir.as_path()));
        assert_eq!(run.timeout, config.flash.script_timeout());
    }

    #[cfg(unix)]
    #[test]
    fn test_rom_script_from_relative_directory() {
        let scratch = TempDir::new().unwrap();
        let mut config = test_config(scratch.path());
        config.tools.shell = "sh".to_string();

        let rom = tempfile::Builder::new()
            .prefix("relative_rom")
            .tempdir_in(".")
            .unwrap();
        let relative = Path::new(".").join(rom.path().file_name().unwrap());
        write_file(&relative, "flash_all.sh", "exit 0\n");

        let transport = SystemTransport::new(config.tools.clone());
        let execution = FlashManager::new(&transport, &config)
            .flash_rom(&relative, &FlashOptions::default())
            .unwrap();

        let run = execution.script.unwrap();
        assert!(run.success, "script failed: {}", run.diagnostics);
        assert!(run.script.is_absolute());
        assert!(run.script.ends_with("flash_all.sh"));
    }

    #[test]
    fn test_failing_script_is_command_failed() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let rom_dir = dir.path().join("rom");
        write_file(&rom_dir, "flash_all.sh", "#!/bin/sh");
        let mock = fastboot_device().fail_with("bash", "Missmatching image and device");

        let outcome = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Rom, &FlashSource::Local(rom_dir), &FlashOptions::default())
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(mock.count("fastboot reboot"), 0);
        match outcome.check().unwrap_err() {
            FlashError::CommandFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("Missmatching"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rom_rejects_unsupported_archive() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let rom = write_file(dir.path(), "rom.rar", "rar");
        let mock = fastboot_device();

        let err = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Rom, &FlashSource::Local(rom), &FlashOptions::default())
            .unwrap_err();

        assert!(matches!(
            err,
            FlashError::PreconditionFailed(Precondition::UnsupportedArchive(ref ext)) if ext == ".rar"
        ));
        assert!(mock.mutating_calls().is_empty());
        assert!(!dir.path().join("scratch").exists());
    }

    #[test]
    fn test_payload_without_dumper_reports_install_hint() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let payload = write_file(dir.path(), "payload.bin", "CrAU");
        let mock = fastboot_device();

        let err = FlashManager::new(&mock, &config)
            .flash(FlashTarget::Payload, &FlashSource::Local(payload), &FlashOptions::default())
            .unwrap_err();

        match err {
            FlashError::PreconditionFailed(Precondition::ToolMissing { candidates, hint }) => {
                assert_eq!(candidates, vec!["payload-dumper-go", "payload_dumper"]);
                assert_eq!(hint, PAYLOAD_INSTALL_HINT);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_payload_dump_then_manual_flash() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let payload = write_file(dir.path(), "payload.bin", "CrAU");
        let mock = fastboot_device()
            .installed("payload_dumper")
            .on_run("payload_dumper", |inv| {
                let out = PathBuf::from(&inv.args[1]);
                fs::write(out.join("boot.img"), "boot").unwrap();
                fs::write(out.join("dtbo.img"), "dtbo").unwrap();
            });

        let outcome = FlashManager::new(&mock, &config)
            .flash(
                FlashTarget::Payload,
                &FlashSource::Local(payload),
                &FlashOptions {
                    slot: SlotSelector::A,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(outcome.success);
        let dump = mock
            .calls()
            .into_iter()
            .find(|inv| inv.program.label() == "payload_dumper")
            .unwrap();
        assert_eq!(dump.args[0], "--out");
        assert_eq!(
            flash_lines(&mock),
            vec![
                "payload_dumper --out",
                "fastboot flash boot_a",
                "fastboot flash dtbo_a",
                "fastboot reboot"
            ]
        );
        let out = PathBuf::from(&dump.args[1]);
        assert!(out.ends_with(format!("payload_out_{}", std::process::id())));
        assert!(!out.exists());
    }

    #[test]
    fn test_remote_source_goes_through_fetcher() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = fastboot_device();
        let fetcher = StubFetcher { body: Some("img") };

        let outcome = FlashManager::new(&mock, &config)
            .with_fetcher(&fetcher)
            .flash(
                FlashTarget::Recovery,
                &FlashSource::Remote("https://example.com/twrp/recovery.img".to_string()),
                &FlashOptions::default(),
            )
            .unwrap();

        assert!(outcome.success);
        assert!(dir.path().join("downloads").join("recovery.img").exists());
    }

    #[test]
    fn test_download_checksum_follows_auto_verify() {
        struct RecordingFetcher(Mutex<Vec<Option<Checksum>>>);

        impl Fetcher for RecordingFetcher {
            fn fetch(
                &self,
                url: &str,
                dest_dir: &Path,
                checksum: Option<&Checksum>,
            ) -> Result<PathBuf> {
                self.0.lock().unwrap().push(checksum.cloned());
                fs::create_dir_all(dest_dir)?;
                let path = dest_dir.join(file_name_from_url(url));
                fs::write(&path, "img")?;
                Ok(path)
            }
        }

        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        let options = FlashOptions {
            checksum: Some(Checksum::md5("5eb63bbbe01eeed093cb22bb8f5acdc3")),
            no_reboot: true,
            ..Default::default()
        };
        let source = FlashSource::Remote("https://example.com/boot.img".to_string());
        let fetcher = RecordingFetcher(Mutex::new(Vec::new()));

        let mock = fastboot_device();
        FlashManager::new(&mock, &config)
            .with_fetcher(&fetcher)
            .flash(FlashTarget::Boot, &source, &options)
            .unwrap();

        config.flash.auto_verify = false;
        let mock = fastboot_device();
        FlashManager::new(&mock, &config)
            .with_fetcher(&fetcher)
            .flash(FlashTarget::Boot, &source, &options)
            .unwrap();

        let seen = fetcher.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_ref().map(|c| c.algo), Some(ChecksumAlgo::Md5));
        assert_eq!(seen[1], None);
    }

    #[test]
    fn test_failed_download_aborts_before_mutation() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let mock = fastboot_device();
        let fetcher = StubFetcher { body: None };

        let err = FlashManager::new(&mock, &config)
            .with_fetcher(&fetcher)
            .flash(
                FlashTarget::Rom,
                &FlashSource::Remote("https://example.com/rom.tgz".to_string()),
                &FlashOptions::default(),
            )
            .unwrap_err();

        assert!(matches!(err, FlashError::Download(_)));
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_shutdown_cancels_before_first_command() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let image = write_file(dir.path(), "boot.img", "img");
        let mock = fastboot_device();

        let manager = FlashManager::new(&mock, &config);
        manager.request_shutdown();
        let err = manager
            .flash(FlashTarget::Boot, &FlashSource::Local(image), &FlashOptions::default())
            .unwrap_err();

        assert!(matches!(err, FlashError::Cancelled(_)));
        assert!(mock.mutating_calls().is_empty());
    }
}
