//! Reboot mode mapping

use crate::core::error::{FlashError, Precondition, Result};
use crate::device::detector::DeviceDetector;
use crate::device::record::DeviceMode;
use crate::device::transport::{Invocation, Transport};
use log::info;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Where the device should boot into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebootTarget {
    System,
    Bootloader,
    Recovery,
    Fastbootd,
    Edl,
}

impl RebootTarget {
    pub const ALL: [RebootTarget; 5] = [
        RebootTarget::System,
        RebootTarget::Bootloader,
        RebootTarget::Recovery,
        RebootTarget::Fastbootd,
        RebootTarget::Edl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RebootTarget::System => "system",
            RebootTarget::Bootloader => "bootloader",
            RebootTarget::Recovery => "recovery",
            RebootTarget::Fastbootd => "fastbootd",
            RebootTarget::Edl => "edl",
        }
    }

    /// Arguments for the OS-shell backend
    fn adb_args(&self) -> &'static [&'static str] {
        match self {
            RebootTarget::System => &["reboot"],
            RebootTarget::Bootloader => &["reboot", "bootloader"],
            RebootTarget::Recovery => &["reboot", "recovery"],
            RebootTarget::Fastbootd => &["reboot", "fastboot"],
            RebootTarget::Edl => &["reboot", "edl"],
        }
    }

    /// Arguments for the bootloader backend
    fn fastboot_args(&self) -> &'static [&'static str] {
        match self {
            RebootTarget::System => &["reboot"],
            RebootTarget::Bootloader => &["reboot-bootloader"],
            RebootTarget::Recovery => &["reboot-recovery"],
            RebootTarget::Fastbootd => &["reboot", "fastboot"],
            RebootTarget::Edl => &["oem", "edl"],
        }
    }
}

impl Display for RebootTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RebootTarget {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        RebootTarget::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FlashError::UnknownTarget {
                kind: "reboot",
                name: s.to_string(),
                expected: "system, bootloader, recovery, fastbootd, edl",
            })
    }
}

/// The literal command that reboots a device in `mode` into `target`
pub fn reboot_invocation(target: RebootTarget, mode: DeviceMode) -> Result<Invocation> {
    if mode.is_os_shell() {
        Ok(Invocation::adb(target.adb_args().iter().copied()))
    } else if mode.is_bootloader() {
        Ok(Invocation::fastboot(target.fastboot_args().iter().copied()))
    } else if mode == DeviceMode::None {
        Err(FlashError::precondition(Precondition::NoDevice))
    } else {
        Err(FlashError::precondition(Precondition::WrongMode {
            required: "adb, recovery or fastboot",
            actual: mode,
        }))
    }
}

/// Detect the device and reboot it into `target`. Returns the mode it was in.
pub fn reboot_device(transport: &dyn Transport, target: RebootTarget) -> Result<DeviceMode> {
    let mode = DeviceDetector::new(transport).current_mode();
    let invocation = reboot_invocation(target, mode)?;
    info!("Rebooting {} device to {}", mode, target);
    transport.run(&invocation)?;
    Ok(mode)
}
