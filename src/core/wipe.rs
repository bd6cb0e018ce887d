//! Partition wipes

use crate::core::confirm::{self, ConfirmGate};
use crate::core::error::{FlashError, Precondition, Result};
use crate::device::detector::DeviceDetector;
use crate::device::record::DeviceMode;
use crate::device::transport::{Invocation, Transport, FLASH_TIMEOUT};
use log::{error, info};
use serde::Serialize;
use std::fmt::{self, Display};
use std::str::FromStr;

/// What can be wiped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WipeTarget {
    /// `userdata`, via the bootloader
    Data,
    /// `cache`, via the bootloader
    Cache,
    /// ART cache, via the OS shell
    Dalvik,
}

impl WipeTarget {
    pub const ALL: [WipeTarget; 3] = [WipeTarget::Data, WipeTarget::Cache, WipeTarget::Dalvik];

    pub fn as_str(&self) -> &'static str {
        match self {
            WipeTarget::Data => "data",
            WipeTarget::Cache => "cache",
            WipeTarget::Dalvik => "dalvik",
        }
    }

    pub fn invocation(&self) -> Invocation {
        let invocation = match self {
            WipeTarget::Data => Invocation::fastboot(["erase", "userdata"]),
            WipeTarget::Cache => Invocation::fastboot(["erase", "cache"]),
            WipeTarget::Dalvik => Invocation::adb(["shell", "rm", "-rf", "/data/dalvik-cache"]),
        };
        invocation.with_timeout(FLASH_TIMEOUT)
    }

    /// The mode this target's command needs, or a description of it
    fn check_mode(&self, mode: DeviceMode) -> std::result::Result<(), Precondition> {
        let (ok, required) = match self {
            WipeTarget::Data | WipeTarget::Cache => (mode.is_bootloader(), "fastboot"),
            WipeTarget::Dalvik => (mode.is_os_shell(), "adb or recovery"),
        };
        if ok {
            Ok(())
        } else {
            Err(Precondition::WrongMode {
                required,
                actual: mode,
            })
        }
    }
}

impl Display for WipeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WipeTarget {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self> {
        WipeTarget::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FlashError::UnknownTarget {
                kind: "wipe",
                name: s.to_string(),
                expected: "data, cache, dalvik",
            })
    }
}

/// Result for one wipe target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WipeResult {
    pub target: WipeTarget,
    pub success: bool,
    pub diagnostics: String,
}

/// Results for every requested target, in request order
#[derive(Debug, Clone, Default, Serialize)]
pub struct WipeReport {
    pub results: Vec<WipeResult>,
}

impl WipeReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failed(&self) -> Vec<WipeTarget> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.target)
            .collect()
    }
}

/// Wipe `targets` after confirmation.
///
/// Each target is checked against the detected mode on its own; a target
/// in the wrong mode or a failing command does not stop later targets.
pub fn wipe(
    transport: &dyn Transport,
    targets: &[WipeTarget],
    gate: &dyn ConfirmGate,
) -> Result<WipeReport> {
    let mut unique: Vec<WipeTarget> = Vec::with_capacity(targets.len());
    for target in targets {
        if !unique.contains(target) {
            unique.push(*target);
        }
    }
    if unique.is_empty() {
        return Err(FlashError::UnknownTarget {
            kind: "wipe",
            name: String::new(),
            expected: "data, cache, dalvik (or --all)",
        });
    }

    let names: Vec<&str> = unique.iter().map(|t| t.as_str()).collect();
    confirm::require(gate, &format!("wipe {}", names.join(", ")))?;

    let mode = DeviceDetector::new(transport).current_mode();
    if mode == DeviceMode::None {
        return Err(FlashError::precondition(Precondition::NoDevice));
    }

    let mut report = WipeReport::default();
    for target in unique {
        let result = match target.check_mode(mode) {
            Err(condition) => {
                error!("Skipping {}: {}", target, condition);
                WipeResult {
                    target,
                    success: false,
                    diagnostics: condition.to_string(),
                }
            }
            Ok(()) => {
                info!("Wiping {}...", target);
                match transport.run(&target.invocation()) {
                    Ok(_) => {
                        info!("Wiped: {}", target);
                        WipeResult {
                            target,
                            success: true,
                            diagnostics: String::new(),
                        }
                    }
                    Err(u) => {
                        error!("Failed to wipe {}: {}", target, u.diagnostics());
                        WipeResult {
                            target,
                            success: false,
                            diagnostics: u.diagnostics(),
                        }
                    }
                }
            }
        };
        report.results.push(result);
    }

    Ok(report)
}
