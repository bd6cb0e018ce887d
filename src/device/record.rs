//! Canonical device snapshot produced by one detection call

use serde::{Serialize, Serializer};
use std::fmt::{self, Display};

/// Sentinel for any property a backend could not provide
pub const UNKNOWN: &str = "unknown";

/// Slot value reported by devices without A/B partitions
pub const SINGLE_SLOT: &str = "N/A (A-only)";

/// The mutually-exclusive connection states a device can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceMode {
    /// Booted Android with USB debugging
    Adb,
    /// Primary bootloader
    Fastboot,
    /// Userspace fastboot (dynamic partitions)
    Fastbootd,
    /// Recovery with adb available
    Recovery,
    /// Visible on USB but no backend answers
    UsbUnknown,
    /// Nothing connected
    #[default]
    None,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Adb => "adb",
            DeviceMode::Fastboot => "fastboot",
            DeviceMode::Fastbootd => "fastbootd",
            DeviceMode::Recovery => "recovery",
            DeviceMode::UsbUnknown => "usb-unknown",
            DeviceMode::None => "none",
        }
    }

    /// Commands are issued through adb in these modes
    pub fn is_os_shell(&self) -> bool {
        matches!(self, DeviceMode::Adb | DeviceMode::Recovery)
    }

    /// Commands are issued through fastboot in these modes
    pub fn is_bootloader(&self) -> bool {
        matches!(self, DeviceMode::Fastboot | DeviceMode::Fastbootd)
    }
}

impl Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bootloader lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockState {
    Locked,
    Unlocked,
    #[default]
    Unknown,
}

impl LockState {
    /// Resolve from the two independent OS-shell properties.
    ///
    /// `green` or `flash.locked=1` wins; then `orange`/`yellow` or
    /// `flash.locked=0`; anything else is unknown.
    pub fn from_boot_props(verified_boot_state: &str, flash_locked: &str) -> Self {
        let verified = verified_boot_state.trim();
        let locked = flash_locked.trim();
        if verified == "green" || locked == "1" {
            LockState::Locked
        } else if verified == "orange" || verified == "yellow" || locked == "0" {
            LockState::Unlocked
        } else {
            LockState::Unknown
        }
    }

    /// Map the bootloader `unlocked` variable (`yes`/`no`)
    pub fn from_unlocked_var(value: &str) -> Self {
        match value.trim() {
            "yes" => LockState::Unlocked,
            "no" => LockState::Locked,
            _ => LockState::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LockState::Locked => "no (locked)",
            LockState::Unlocked => "yes (unlocked)",
            LockState::Unknown => UNKNOWN,
        }
    }
}

impl Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for LockState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

/// Canonical snapshot of a detected device.
///
/// Only the gatherers in [`crate::device::detector`] can construct one, and
/// each constructs it from a single backend, so a record never mixes
/// properties from two modes. Every field is always present; missing data is
/// the [`UNKNOWN`] sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    serial: String,
    mode: DeviceMode,
    brand: String,
    model: String,
    codename: String,
    os_version: String,
    build_id: String,
    security_patch: String,
    cpu_abi: String,
    kernel: String,
    battery: String,
    slot: String,
    bootloader: LockState,
    storage: String,
    memory: String,
    display: String,
}

/// Serialized key set of [`DeviceRecord`], in display order
pub const FIELD_NAMES: [&str; 16] = [
    "serial",
    "mode",
    "brand",
    "model",
    "codename",
    "os_version",
    "build_id",
    "security_patch",
    "cpu_abi",
    "kernel",
    "battery",
    "slot",
    "bootloader",
    "storage",
    "memory",
    "display",
];

/// Writable view handed to a gatherer while it populates a fresh record
pub(crate) struct RecordBuilder {
    record: DeviceRecord,
}

macro_rules! setters {
    ($($name:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&mut self, value: impl AsRef<str>) -> &mut Self {
                let value = value.as_ref().trim();
                if !value.is_empty() {
                    self.record.$name = value.to_string();
                }
                self
            }
        )*
    };
}

impl RecordBuilder {
    pub(crate) fn new(serial: &str, mode: DeviceMode) -> Self {
        let unknown = || UNKNOWN.to_string();
        let serial = if serial.trim().is_empty() {
            unknown()
        } else {
            serial.trim().to_string()
        };
        Self {
            record: DeviceRecord {
                serial,
                mode,
                brand: unknown(),
                model: unknown(),
                codename: unknown(),
                os_version: unknown(),
                build_id: unknown(),
                security_patch: unknown(),
                cpu_abi: unknown(),
                kernel: unknown(),
                battery: unknown(),
                slot: unknown(),
                bootloader: LockState::Unknown,
                storage: unknown(),
                memory: unknown(),
                display: unknown(),
            },
        }
    }

    setters!(
        brand,
        model,
        codename,
        os_version,
        build_id,
        security_patch,
        cpu_abi,
        kernel,
        battery,
        slot,
        storage,
        memory,
        display,
    );

    pub(crate) fn bootloader(&mut self, state: LockState) -> &mut Self {
        self.record.bootloader = state;
        self
    }

    pub(crate) fn build(self) -> DeviceRecord {
        self.record
    }
}

impl DeviceRecord {
    pub fn serial(&self) -> &str {
        &self.serial
    }
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }
    pub fn brand(&self) -> &str {
        &self.brand
    }
    pub fn model(&self) -> &str {
        &self.model
    }
    pub fn codename(&self) -> &str {
        &self.codename
    }
    pub fn os_version(&self) -> &str {
        &self.os_version
    }
    pub fn build_id(&self) -> &str {
        &self.build_id
    }
    pub fn security_patch(&self) -> &str {
        &self.security_patch
    }
    pub fn cpu_abi(&self) -> &str {
        &self.cpu_abi
    }
    pub fn kernel(&self) -> &str {
        &self.kernel
    }
    pub fn battery(&self) -> &str {
        &self.battery
    }
    pub fn slot(&self) -> &str {
        &self.slot
    }
    pub fn bootloader(&self) -> LockState {
        self.bootloader
    }
    pub fn storage(&self) -> &str {
        &self.storage
    }
    pub fn memory(&self) -> &str {
        &self.memory
    }
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Short one-line description for logs and watch notifications
    pub fn summary(&self) -> String {
        format!(
            "{} {} ({}) [{}]",
            self.brand,
            self.model,
            self.serial,
            self.mode.as_str().to_uppercase()
        )
    }

    /// Label/value rows for table rendering
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Serial", self.serial.clone()),
            ("Mode", self.mode.as_str().to_uppercase()),
            ("Brand", self.brand.clone()),
            ("Model", self.model.clone()),
            ("Codename", self.codename.clone()),
            ("Android Version", self.os_version.clone()),
            ("Build ID", self.build_id.clone()),
            ("Security Patch", self.security_patch.clone()),
            ("CPU ABI", self.cpu_abi.clone()),
            ("Memory", self.memory.clone()),
            ("Storage", self.storage.clone()),
            ("Display", self.display.clone()),
            ("Slot", self.slot.clone()),
            ("Bootloader", self.bootloader.label().to_string()),
            ("Battery", self.battery.clone()),
            ("Kernel", self.kernel.clone()),
        ]
    }
}
