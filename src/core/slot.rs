//! Slot fallback strategy for partition-targeted flashes
//!
//! For every requested slot the suffixed name is tried first (`boot_a`); if
//! that command fails the bare name (`boot`) is retried once before the slot
//! is declared failed. Single-slot devices reject suffixed names, so the bare
//! retry is what makes them work.

use crate::core::error::FlashError;
use crate::device::transport::{Invocation, Transport};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Which slot suffixes to attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotSelector {
    /// `_a` then `_b`
    #[default]
    All,
    A,
    B,
}

impl SlotSelector {
    /// Suffixes in attempt order
    pub fn suffixes(&self) -> &'static [&'static str] {
        match self {
            SlotSelector::All => &["_a", "_b"],
            SlotSelector::A => &["_a"],
            SlotSelector::B => &["_b"],
        }
    }
}

impl Display for SlotSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotSelector::All => "all",
            SlotSelector::A => "a",
            SlotSelector::B => "b",
        })
    }
}

impl FromStr for SlotSelector {
    type Err = FlashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('_').to_ascii_lowercase().as_str() {
            "all" => Ok(SlotSelector::All),
            "a" => Ok(SlotSelector::A),
            "b" => Ok(SlotSelector::B),
            _ => Err(FlashError::UnknownTarget {
                kind: "slot",
                name: s.to_string(),
                expected: "all, a, b",
            }),
        }
    }
}

/// Result of trying one slot suffix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAttempt {
    /// Suffix requested, e.g. `_a`
    pub suffix: String,
    /// Partition names sent to the device, in order
    pub tried: Vec<String>,
    /// The name that was written, if any
    pub flashed_as: Option<String>,
    /// Diagnostics from the last failing command
    pub diagnostics: String,
}

impl SlotAttempt {
    pub fn succeeded(&self) -> bool {
        self.flashed_as.is_some()
    }

    /// Name used when reporting this slot
    pub fn label(&self, partition: &str) -> String {
        format!("{}{}", partition, self.suffix)
    }
}

/// Aggregate status of one partition across the requested slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    /// Every requested slot was written
    Flashed,
    /// At least one slot was written and at least one was not
    Partial,
    /// Nothing was written
    Failed,
}

impl SlotStatus {
    fn from_attempts(attempts: &[SlotAttempt]) -> Self {
        let ok = attempts.iter().filter(|a| a.succeeded()).count();
        if !attempts.is_empty() && ok == attempts.len() {
            SlotStatus::Flashed
        } else if ok > 0 {
            SlotStatus::Partial
        } else {
            SlotStatus::Failed
        }
    }
}

/// Per-partition entry of a flash outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionOutcome {
    pub partition: String,
    pub attempts: Vec<SlotAttempt>,
    pub status: SlotStatus,
    pub diagnostics: String,
}

impl PartitionOutcome {
    /// Outcome for a partition written once without slot handling
    pub fn single(partition: &str, result: Result<(), String>) -> Self {
        let (flashed_as, diagnostics) = match result {
            Ok(()) => (Some(partition.to_string()), String::new()),
            Err(diag) => (None, diag),
        };
        let attempts = vec![SlotAttempt {
            suffix: String::new(),
            tried: vec![partition.to_string()],
            flashed_as,
            diagnostics: diagnostics.clone(),
        }];
        Self {
            partition: partition.to_string(),
            status: SlotStatus::from_attempts(&attempts),
            attempts,
            diagnostics,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == SlotStatus::Flashed
    }

    /// Every partition name sent to the device, in order
    pub fn tried_names(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .flat_map(|a| a.tried.iter().map(String::as_str))
            .collect()
    }

    /// Slots that were written, labelled `partition_suffix`
    pub fn succeeded_slots(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|a| a.succeeded())
            .map(|a| a.label(&self.partition))
            .collect()
    }

    /// Slots that were not written, labelled `partition_suffix`
    pub fn failed_slots(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter(|a| !a.succeeded())
            .map(|a| a.label(&self.partition))
            .collect()
    }
}

fn flash_once(
    transport: &dyn Transport,
    name: &str,
    image: &Path,
    timeout: Duration,
) -> Result<(), String> {
    let invocation = Invocation::fastboot([
        "flash".to_string(),
        name.to_string(),
        image.display().to_string(),
    ])
    .with_timeout(timeout);
    transport
        .run(&invocation)
        .map(|_| ())
        .map_err(|u| u.diagnostics())
}

/// Flash `image` to `partition` on every slot `selector` names.
///
/// Never returns early: every requested slot is attempted so the caller sees
/// the full picture.
pub fn flash_partition(
    transport: &dyn Transport,
    partition: &str,
    image: &Path,
    selector: SlotSelector,
    timeout: Duration,
) -> PartitionOutcome {
    let mut attempts = Vec::with_capacity(selector.suffixes().len());

    for suffix in selector.suffixes() {
        let suffixed = format!("{}{}", partition, suffix);
        let mut attempt = SlotAttempt {
            suffix: suffix.to_string(),
            tried: vec![suffixed.clone()],
            flashed_as: None,
            diagnostics: String::new(),
        };

        match flash_once(transport, &suffixed, image, timeout) {
            Ok(()) => attempt.flashed_as = Some(suffixed),
            Err(diag) => {
                debug!("{} rejected ({}), retrying as {}", suffixed, diag, partition);
                attempt.tried.push(partition.to_string());
                match flash_once(transport, partition, image, timeout) {
                    Ok(()) => attempt.flashed_as = Some(partition.to_string()),
                    Err(diag) => {
                        warn!("Failed to flash {} on slot {}: {}", partition, suffix, diag);
                        attempt.diagnostics = diag;
                    }
                }
            }
        }
        attempts.push(attempt);
    }

    let status = SlotStatus::from_attempts(&attempts);
    let diagnostics = attempts
        .iter()
        .filter(|a| !a.diagnostics.is_empty())
        .map(|a| format!("{}: {}", a.label(partition), a.diagnostics))
        .collect::<Vec<_>>()
        .join("; ");

    PartitionOutcome {
        partition: partition.to_string(),
        attempts,
        status,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::MockTransport;

    fn flash_names(mock: &MockTransport) -> Vec<String> {
        mock.calls()
            .iter()
            .filter(|inv| inv.args.first().map(String::as_str) == Some("flash"))
            .map(|inv| inv.args[1].clone())
            .collect()
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("all".parse::<SlotSelector>().unwrap(), SlotSelector::All);
        assert_eq!("A".parse::<SlotSelector>().unwrap(), SlotSelector::A);
        assert_eq!("_b".parse::<SlotSelector>().unwrap(), SlotSelector::B);
        assert!(matches!(
            "c".parse::<SlotSelector>(),
            Err(FlashError::UnknownTarget { kind: "slot", .. })
        ));
    }

    #[test]
    fn test_all_slots_retry_bare_name_in_order() {
        let mock = MockTransport::new()
            .fail("fastboot flash boot_a")
            .fail("fastboot flash boot_b")
            .fail("fastboot flash boot");
        let outcome = flash_partition(
            &mock,
            "boot",
            Path::new("boot.img"),
            SlotSelector::All,
            Duration::from_secs(1),
        );

        assert_eq!(flash_names(&mock), vec!["boot_a", "boot", "boot_b", "boot"]);
        assert_eq!(outcome.tried_names(), vec!["boot_a", "boot", "boot_b", "boot"]);
        assert_eq!(outcome.status, SlotStatus::Failed);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_suffixed_success_skips_bare_retry() {
        let mock = MockTransport::new();
        let outcome = flash_partition(
            &mock,
            "boot",
            Path::new("boot.img"),
            SlotSelector::All,
            Duration::from_secs(1),
        );
        assert_eq!(flash_names(&mock), vec!["boot_a", "boot_b"]);
        assert_eq!(outcome.status, SlotStatus::Flashed);
        assert_eq!(outcome.succeeded_slots(), vec!["boot_a", "boot_b"]);
    }

    #[test]
    fn test_slot_a_succeeds_slot_b_fails_is_partial() {
        // boot_b and the bare name are rejected; boot_a is accepted
        let mock = MockTransport::new()
            .fail("fastboot flash boot_b")
            .fail("fastboot flash boot");
        let outcome = flash_partition(
            &mock,
            "boot",
            Path::new("boot.img"),
            SlotSelector::All,
            Duration::from_secs(1),
        );

        assert_eq!(flash_names(&mock), vec!["boot_a", "boot_b", "boot"]);
        assert_eq!(outcome.status, SlotStatus::Partial);
        assert_eq!(outcome.succeeded_slots(), vec!["boot_a"]);
        assert_eq!(outcome.failed_slots(), vec!["boot_b"]);
        assert!(outcome.diagnostics.contains("boot_b"));
    }

    #[test]
    fn test_single_slot_device_uses_bare_name() {
        let mock = MockTransport::new().fail("fastboot flash vbmeta_a");
        let outcome = flash_partition(
            &mock,
            "vbmeta",
            Path::new("vbmeta.img"),
            SlotSelector::A,
            Duration::from_secs(1),
        );
        assert_eq!(flash_names(&mock), vec!["vbmeta_a", "vbmeta"]);
        assert_eq!(outcome.status, SlotStatus::Flashed);
        assert_eq!(outcome.attempts[0].flashed_as.as_deref(), Some("vbmeta"));
    }

    #[test]
    fn test_single_outcome() {
        let ok = PartitionOutcome::single("super", Ok(()));
        assert!(ok.succeeded());
        let failed = PartitionOutcome::single("super", Err("no space".into()));
        assert_eq!(failed.status, SlotStatus::Failed);
        assert_eq!(failed.failed_slots(), vec!["super"]);
    }
}
