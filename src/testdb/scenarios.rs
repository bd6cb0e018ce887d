//! Predefined device scenarios
//!
//! Each scenario pairs a scripted transport (what the phone and the host
//! tools would answer) with one operation to run against it and the result
//! that operation must produce.

use super::mock_transport::MockTransport;
use crate::core::flash::FlashTarget;
use crate::core::wipe::WipeTarget;
use crate::device::reboot::RebootTarget;
use crate::device::record::DeviceMode;

const ADB_HEADER: &str = "List of devices attached\n";

/// Operation a scenario exercises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioAction {
    /// One detection call
    Detect,
    /// Flash the target from a generated local source
    Flash(FlashTarget),
    Reboot(RebootTarget),
    Wipe(WipeTarget),
}

/// A complete test scenario with a scripted transport
#[derive(Debug, Clone)]
pub struct TestScenario {
    /// Scenario name for identification
    pub name: String,
    /// Description of what this scenario tests
    pub description: String,
    /// Builds a fresh transport for each run
    pub transport: fn() -> MockTransport,
    pub action: ScenarioAction,
    /// Expected outcome
    pub expected: ExpectedResults,
    /// Tags for filtering scenarios
    pub tags: Vec<String>,
}

/// Expected results from running a scenario
#[derive(Debug, Clone, Default)]
pub struct ExpectedResults {
    /// Mode reported by detection (`DeviceMode::None` for no record)
    pub mode: Option<DeviceMode>,
    /// Serialized record fields that must match exactly
    pub fields: Vec<(&'static str, &'static str)>,
    /// Should the operation succeed
    pub should_succeed: bool,
    /// Error kind (see `FlashError::kind`) when it should not
    pub expected_error: Option<&'static str>,
    /// Command-line prefixes that must appear, in this order
    pub commands: Vec<&'static str>,
    /// Command-line prefixes that must never appear
    pub forbidden: Vec<&'static str>,
    /// Upper bound on device-mutating commands
    pub max_mutating: Option<usize>,
}

impl TestScenario {
    /// Create a new test scenario
    pub fn new(
        name: &str,
        description: &str,
        transport: fn() -> MockTransport,
        action: ScenarioAction,
        expected: ExpectedResults,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            transport,
            action,
            expected,
            tags: Vec::new(),
        }
    }

    /// Add tags to the scenario
    pub fn with_tags(mut self, tags: Vec<&str>) -> Self {
        self.tags = tags.into_iter().map(String::from).collect();
        self
    }
}

/// Collection of all predefined test scenarios
pub struct ScenarioLibrary;

impl ScenarioLibrary {
    // =========================================================================
    // TRANSPORT BUILDERS
    // =========================================================================

    /// Booted phone that answers every property the detector reads
    pub fn adb_full(serial: &str) -> MockTransport {
        MockTransport::new()
            .respond("adb devices", &format!("{}{}\tdevice\n", ADB_HEADER, serial))
            .respond("adb shell getprop ro.product.brand", "Xiaomi\n")
            .respond("adb shell getprop ro.product.model", "Redmi Note 12\n")
            .respond("adb shell getprop ro.product.device", "tapas\n")
            .respond("adb shell getprop ro.build.version.release", "14\n")
            .respond("adb shell getprop ro.build.display.id", "UKQ1.230917.001\n")
            .respond("adb shell getprop ro.build.version.security_patch", "2024-05-01\n")
            .respond("adb shell getprop ro.product.cpu.abi", "arm64-v8a\n")
            .respond("adb shell getprop ro.kernel.version", "5.15.123-android13-8\n")
            .respond("adb shell getprop ro.boot.slot_suffix", "_a\n")
            .respond("adb shell getprop ro.boot.verifiedbootstate", "orange\n")
            .respond("adb shell getprop ro.boot.flash.locked", "0\n")
            .respond(
                "adb shell dumpsys battery",
                "Current Battery Service state:\n  AC powered: false\n  USB powered: true\n  status: 2\n  health: 2\n  level: 87\n  scale: 100\n",
            )
            .respond(
                "adb shell df /data",
                "Filesystem     1K-blocks    Used Available Use% Mounted on\n/dev/block/dm-5 115609024 52428800 63180224  46% /data\n",
            )
            .respond(
                "adb shell cat /proc/meminfo",
                "MemTotal:        7802064 kB\nMemFree:          302024 kB\nMemAvailable:    3145728 kB\n",
            )
            .respond("adb shell wm size", "Physical size: 1080x2400\n")
            .respond("adb shell wm density", "Physical density: 440\n")
    }

    /// Phone sitting in the primary bootloader
    pub fn fastboot_device(serial: &str, unlocked: bool) -> MockTransport {
        MockTransport::new()
            .respond("adb devices", ADB_HEADER)
            .respond("fastboot devices", &format!("{}\tfastboot\n", serial))
            .respond_stderr("fastboot getvar is-userspace", "is-userspace: no\n")
            .respond_stderr("fastboot getvar product", "product: tapas\n")
            .respond_stderr("fastboot getvar current-slot", "current-slot: a\n")
            .respond_stderr(
                "fastboot getvar unlocked",
                if unlocked {
                    "unlocked: yes\nFinished. Total time: 0.001s\n"
                } else {
                    "unlocked: no\nFinished. Total time: 0.001s\n"
                },
            )
    }

    fn unlocked_fastboot() -> MockTransport {
        Self::fastboot_device("XYZ789", true)
    }

    // =========================================================================
    // DETECTION SCENARIOS
    // =========================================================================

    /// Scenario: Booted phone with every property available
    pub fn adb_device() -> TestScenario {
        TestScenario::new(
            "adb_device",
            "Booted phone; every record field populated",
            || Self::adb_full("ABC123"),
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::Adb),
                fields: vec![
                    ("serial", "ABC123"),
                    ("brand", "Xiaomi"),
                    ("model", "Redmi Note 12"),
                    ("battery", "87% (Charging)"),
                    ("slot", "_a"),
                    ("bootloader", "yes (unlocked)"),
                    ("display", "1080x2400 @ 440 DPI"),
                ],
                should_succeed: true,
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "adb", "basic"])
    }

    /// Scenario: Booted phone that answers nothing but `adb devices`
    pub fn adb_minimal() -> TestScenario {
        TestScenario::new(
            "adb_minimal",
            "Booted phone with no readable properties; sentinels everywhere",
            || MockTransport::new().respond("adb devices", "List of devices attached\nABC123\tdevice\n"),
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::Adb),
                fields: vec![
                    ("brand", "unknown"),
                    ("battery", "unknown"),
                    ("bootloader", "unknown"),
                    ("slot", "N/A (A-only)"),
                ],
                should_succeed: true,
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "adb", "edge-case"])
    }

    /// Scenario: adb answers in recovery
    pub fn recovery_device() -> TestScenario {
        TestScenario::new(
            "recovery_device",
            "Recovery with adb; reported as recovery, not adb",
            || {
                MockTransport::new()
                    .respond("adb devices", "List of devices attached\nABC123\trecovery\n")
                    .respond("fastboot devices", "ABC123\tfastboot\n")
            },
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::Recovery),
                fields: vec![("serial", "ABC123")],
                should_succeed: true,
                forbidden: vec!["fastboot getvar"],
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "recovery"])
    }

    /// Scenario: Locked bootloader
    pub fn fastboot_locked() -> TestScenario {
        TestScenario::new(
            "fastboot_locked",
            "Primary bootloader, locked, slot from getvar",
            || Self::fastboot_device("XYZ789", false),
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::Fastboot),
                fields: vec![
                    ("serial", "XYZ789"),
                    ("bootloader", "no (locked)"),
                    ("slot", "_a"),
                    ("codename", "tapas"),
                    ("brand", "unknown"),
                ],
                should_succeed: true,
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "fastboot", "basic"])
    }

    /// Scenario: Userspace fastboot
    pub fn fastbootd_device() -> TestScenario {
        TestScenario::new(
            "fastbootd_device",
            "Userspace fastboot reported separately from the bootloader",
            || {
                MockTransport::new()
                    .respond("adb devices", ADB_HEADER)
                    .respond("fastboot devices", "XYZ789\tfastboot\n")
                    .respond_stderr("fastboot getvar is-userspace", "is-userspace: yes\n")
            },
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::Fastbootd),
                should_succeed: true,
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "fastboot"])
    }

    /// Scenario: Offline adb entry, visible on the bus only
    pub fn usb_only() -> TestScenario {
        TestScenario::new(
            "usb_only",
            "adb reports the device offline; only the USB enumerator sees it",
            || {
                MockTransport::strict()
                    .respond("adb devices", "List of devices attached\nABC123\toffline\n")
                    .respond("fastboot devices", "")
                    .respond("termux-usb -l", "[\"/dev/bus/usb/001/002\"]\n")
            },
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::UsbUnknown),
                fields: vec![("serial", "/dev/bus/usb/001/002"), ("model", "unknown")],
                should_succeed: true,
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "usb", "edge-case"])
    }

    /// Scenario: Nothing connected, no tools installed
    pub fn no_device() -> TestScenario {
        TestScenario::new(
            "no_device",
            "Every backend unavailable; detection yields no record",
            MockTransport::strict,
            ScenarioAction::Detect,
            ExpectedResults {
                mode: Some(DeviceMode::None),
                should_succeed: true,
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["detect", "no-device", "basic"])
    }

    // =========================================================================
    // FLASH SCENARIOS
    // =========================================================================

    /// Scenario: Boot image to both slots
    pub fn flash_boot() -> TestScenario {
        TestScenario::new(
            "flash_boot",
            "Boot image flashed to _a and _b, then reboot",
            Self::unlocked_fastboot,
            ScenarioAction::Flash(FlashTarget::Boot),
            ExpectedResults {
                should_succeed: true,
                commands: vec![
                    "fastboot flash boot_a",
                    "fastboot flash boot_b",
                    "fastboot reboot",
                ],
                forbidden: vec!["fastboot flash boot"],
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "slot", "basic"])
    }

    /// Scenario: Device without A/B slots
    pub fn flash_boot_single_slot() -> TestScenario {
        TestScenario::new(
            "flash_boot_single_slot",
            "Suffixed names rejected; the bare partition name succeeds",
            || {
                Self::unlocked_fastboot()
                    .fail_with("fastboot flash boot_a", "FAILED (remote: 'partition does not exist')")
                    .fail_with("fastboot flash boot_b", "FAILED (remote: 'partition does not exist')")
            },
            ScenarioAction::Flash(FlashTarget::Boot),
            ExpectedResults {
                should_succeed: true,
                commands: vec![
                    "fastboot flash boot_a",
                    "fastboot flash boot",
                    "fastboot flash boot_b",
                    "fastboot flash boot",
                    "fastboot reboot",
                ],
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "slot", "edge-case"])
    }

    /// Scenario: One slot written, the other not
    pub fn flash_boot_partial() -> TestScenario {
        TestScenario::new(
            "flash_boot_partial",
            "Slot _b fails twice; partial failure and no reboot",
            || {
                Self::unlocked_fastboot()
                    .fail("fastboot flash boot_b")
                    .fail("fastboot flash boot")
            },
            ScenarioAction::Flash(FlashTarget::Boot),
            ExpectedResults {
                should_succeed: false,
                expected_error: Some("partial-failure"),
                commands: vec!["fastboot flash boot_a", "fastboot flash boot_b"],
                forbidden: vec!["fastboot reboot"],
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "slot", "error"])
    }

    /// Scenario: Flash attempted from a booted phone
    pub fn flash_wrong_mode() -> TestScenario {
        TestScenario::new(
            "flash_wrong_mode",
            "Booted phone; flash refused before any command is sent",
            || Self::adb_full("ABC123"),
            ScenarioAction::Flash(FlashTarget::Boot),
            ExpectedResults {
                should_succeed: false,
                expected_error: Some("precondition"),
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "precondition", "error"])
    }

    /// Scenario: Flash with nothing connected
    pub fn flash_no_device() -> TestScenario {
        TestScenario::new(
            "flash_no_device",
            "No device; flash refused",
            MockTransport::strict,
            ScenarioAction::Flash(FlashTarget::Recovery),
            ExpectedResults {
                should_succeed: false,
                expected_error: Some("precondition"),
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "precondition", "no-device", "error"])
    }

    /// Scenario: Super image where the erase step is rejected
    pub fn flash_super_erase_fails() -> TestScenario {
        TestScenario::new(
            "flash_super_erase_fails",
            "Erase of super fails; the flash still proceeds",
            || Self::unlocked_fastboot().fail("fastboot erase super"),
            ScenarioAction::Flash(FlashTarget::Super),
            ExpectedResults {
                should_succeed: true,
                commands: vec!["fastboot erase super", "fastboot flash super"],
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "super", "edge-case"])
    }

    /// Scenario: Payload with no dumper on PATH
    pub fn flash_payload_no_tool() -> TestScenario {
        TestScenario::new(
            "flash_payload_no_tool",
            "payload.bin present but no dumper installed",
            Self::unlocked_fastboot,
            ScenarioAction::Flash(FlashTarget::Payload),
            ExpectedResults {
                should_succeed: false,
                expected_error: Some("precondition"),
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "payload", "precondition", "error"])
    }

    /// Scenario: ROM directory without a vendor script
    pub fn flash_rom_images() -> TestScenario {
        TestScenario::new(
            "flash_rom_images",
            "ROM without flash_all scripts; every image flashed individually",
            Self::unlocked_fastboot,
            ScenarioAction::Flash(FlashTarget::Rom),
            ExpectedResults {
                should_succeed: true,
                commands: vec!["fastboot flash boot_a", "fastboot flash boot_b", "fastboot reboot"],
                forbidden: vec!["bash"],
                ..Default::default()
            },
        )
        .with_tags(vec!["flash", "rom"])
    }

    // =========================================================================
    // REBOOT SCENARIOS
    // =========================================================================

    /// Scenario: Booted phone to bootloader
    pub fn reboot_adb_to_bootloader() -> TestScenario {
        TestScenario::new(
            "reboot_adb_to_bootloader",
            "Booted phone rebooted through adb",
            || MockTransport::new().respond("adb devices", "List of devices attached\nABC123\tdevice\n"),
            ScenarioAction::Reboot(RebootTarget::Bootloader),
            ExpectedResults {
                should_succeed: true,
                commands: vec!["adb reboot bootloader"],
                max_mutating: Some(1),
                ..Default::default()
            },
        )
        .with_tags(vec!["reboot", "adb", "basic"])
    }

    /// Scenario: Bootloader to emergency download
    pub fn reboot_fastboot_to_edl() -> TestScenario {
        TestScenario::new(
            "reboot_fastboot_to_edl",
            "Bootloader rebooted to EDL through the OEM command",
            Self::unlocked_fastboot,
            ScenarioAction::Reboot(RebootTarget::Edl),
            ExpectedResults {
                should_succeed: true,
                commands: vec!["fastboot oem edl"],
                max_mutating: Some(1),
                ..Default::default()
            },
        )
        .with_tags(vec!["reboot", "fastboot"])
    }

    /// Scenario: Reboot with nothing connected
    pub fn reboot_no_device() -> TestScenario {
        TestScenario::new(
            "reboot_no_device",
            "No device; reboot refused",
            MockTransport::strict,
            ScenarioAction::Reboot(RebootTarget::System),
            ExpectedResults {
                should_succeed: false,
                expected_error: Some("precondition"),
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["reboot", "no-device", "error"])
    }

    // =========================================================================
    // WIPE SCENARIOS
    // =========================================================================

    /// Scenario: Cache wipe from the bootloader
    pub fn wipe_cache() -> TestScenario {
        TestScenario::new(
            "wipe_cache",
            "Cache erased through fastboot",
            Self::unlocked_fastboot,
            ScenarioAction::Wipe(WipeTarget::Cache),
            ExpectedResults {
                should_succeed: true,
                commands: vec!["fastboot erase cache"],
                max_mutating: Some(1),
                ..Default::default()
            },
        )
        .with_tags(vec!["wipe", "fastboot"])
    }

    /// Scenario: Dalvik wipe needs the OS shell
    pub fn wipe_dalvik_wrong_mode() -> TestScenario {
        TestScenario::new(
            "wipe_dalvik_wrong_mode",
            "Dalvik cache wipe requested while in the bootloader",
            Self::unlocked_fastboot,
            ScenarioAction::Wipe(WipeTarget::Dalvik),
            ExpectedResults {
                should_succeed: false,
                max_mutating: Some(0),
                ..Default::default()
            },
        )
        .with_tags(vec!["wipe", "precondition", "error"])
    }

    /// Get all available scenarios
    pub fn all_scenarios() -> Vec<TestScenario> {
        vec![
            Self::adb_device(),
            Self::adb_minimal(),
            Self::recovery_device(),
            Self::fastboot_locked(),
            Self::fastbootd_device(),
            Self::usb_only(),
            Self::no_device(),
            Self::flash_boot(),
            Self::flash_boot_single_slot(),
            Self::flash_boot_partial(),
            Self::flash_wrong_mode(),
            Self::flash_no_device(),
            Self::flash_super_erase_fails(),
            Self::flash_payload_no_tool(),
            Self::flash_rom_images(),
            Self::reboot_adb_to_bootloader(),
            Self::reboot_fastboot_to_edl(),
            Self::reboot_no_device(),
            Self::wipe_cache(),
            Self::wipe_dalvik_wrong_mode(),
        ]
    }

    /// Get scenarios by tag
    pub fn scenarios_by_tag(tag: &str) -> Vec<TestScenario> {
        Self::all_scenarios()
            .into_iter()
            .filter(|s| s.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Get quick test scenarios (one per operation family)
    pub fn quick_scenarios() -> Vec<TestScenario> {
        vec![
            Self::adb_device(),
            Self::fastboot_locked(),
            Self::no_device(),
            Self::flash_boot(),
            Self::reboot_adb_to_bootloader(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_all_scenarios_load() {
        let scenarios = ScenarioLibrary::all_scenarios();
        assert!(!scenarios.is_empty());
        let names: HashSet<&str> = scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), scenarios.len(), "scenario names must be unique");
    }

    #[test]
    fn test_scenario_by_tag() {
        let error_scenarios = ScenarioLibrary::scenarios_by_tag("error");
        assert!(!error_scenarios.is_empty());
        for s in &error_scenarios {
            assert!(s.tags.contains(&"error".to_string()));
            assert!(!s.expected.should_succeed);
        }
    }

    #[test]
    fn test_quick_scenarios() {
        let quick = ScenarioLibrary::quick_scenarios();
        assert_eq!(quick.len(), 5);
    }

    #[test]
    fn test_transport_builders_are_fresh() {
        let scenario = ScenarioLibrary::flash_boot();
        let first = (scenario.transport)();
        first.clear_calls();
        let _ = crate::device::detector::DeviceDetector::new(&first).current_mode();
        let second = (scenario.transport)();
        assert!(second.calls().is_empty());
        assert!(!first.calls().is_empty());
    }
}
