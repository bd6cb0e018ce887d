//! Error types for the flashing engine
//!
//! Absence of a backend or device is modelled as a value (`Unavailable`) at the
//! transport layer; the variants here are what surfaces once every fallback
//! has been exhausted.

use crate::device::record::DeviceMode;
use std::path::PathBuf;
use thiserror::Error;

/// A condition that must hold before any device-mutating command is issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// No device answered any backend probe
    NoDevice,
    /// Device is connected but in the wrong mode for the operation
    WrongMode {
        required: &'static str,
        actual: DeviceMode,
    },
    /// The local source file or directory does not exist
    SourceMissing(PathBuf),
    /// The archive extension is not one we can expand
    UnsupportedArchive(String),
    /// None of the candidate external tools is installed
    ToolMissing {
        candidates: Vec<String>,
        hint: String,
    },
    /// A directory that should contain partition images has none
    NoImages(PathBuf),
}

impl std::fmt::Display for Precondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precondition::NoDevice => write!(
                f,
                "no device detected (check the USB cable and USB debugging, or reboot to bootloader manually and retry)"
            ),
            Precondition::WrongMode { required, actual } => write!(
                f,
                "device must be in {} mode (currently: {}). Run: miflasher reboot bootloader",
                required, actual
            ),
            Precondition::SourceMissing(path) => {
                write!(f, "file not found: {}", path.display())
            }
            Precondition::UnsupportedArchive(ext) => {
                write!(f, "unsupported archive format '{}' (expected .zip, .tar.gz or .tgz)", ext)
            }
            Precondition::ToolMissing { candidates, hint } => {
                write!(f, "none of [{}] found on PATH. {}", candidates.join(", "), hint)
            }
            Precondition::NoImages(dir) => {
                write!(f, "no .img files found under {}", dir.display())
            }
        }
    }
}

/// Main error type for detection and flashing operations
#[derive(Error, Debug)]
pub enum FlashError {
    /// Backend or tool is not present, or the device is not connected
    #[error("{command}: unavailable ({reason})")]
    Unavailable { command: String, reason: String },

    /// Non-zero exit or timeout; carries captured diagnostic text
    #[error("command failed: `{command}`: {diagnostics}")]
    CommandFailed { command: String, diagnostics: String },

    /// Wrong device mode, missing source, unsupported archive...
    #[error("precondition failed: {0}")]
    PreconditionFailed(Precondition),

    /// Some partitions/slots were written, others were not
    #[error("partial failure: flashed [{}], failed [{}]", succeeded.join(", "), failed.join(", "))]
    PartialFailure {
        succeeded: Vec<String>,
        failed: Vec<String>,
    },

    /// Unrecognized flash or reboot target name
    #[error("unknown {kind} target '{name}' (expected one of: {expected})")]
    UnknownTarget {
        kind: &'static str,
        name: String,
        expected: &'static str,
    },

    /// Download could not be completed or verified
    #[error("download failed: {0}")]
    Download(String),

    /// Archive could not be read or expanded
    #[error("archive error in '{path}': {message}")]
    Archive { path: PathBuf, message: String },

    /// Operation stopped at a command boundary after a shutdown request
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(String),
}

impl FlashError {
    /// Shorthand for a precondition failure
    pub fn precondition(condition: Precondition) -> Self {
        FlashError::PreconditionFailed(condition)
    }

    /// Whether this is a precondition failure (nothing was sent to the device)
    pub fn is_precondition(&self) -> bool {
        matches!(self, FlashError::PreconditionFailed(_))
    }

    /// Stable short name of the variant, for JSON output and scenario checks
    pub fn kind(&self) -> &'static str {
        match self {
            FlashError::Unavailable { .. } => "unavailable",
            FlashError::CommandFailed { .. } => "command-failed",
            FlashError::PreconditionFailed(_) => "precondition",
            FlashError::PartialFailure { .. } => "partial-failure",
            FlashError::UnknownTarget { .. } => "unknown-target",
            FlashError::Download(_) => "download",
            FlashError::Archive { .. } => "archive",
            FlashError::Cancelled(_) => "cancelled",
            FlashError::Io(_) => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlashError>;

impl From<std::io::Error> for FlashError {
    fn from(err: std::io::Error) -> Self {
        FlashError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_mode_message_names_both_modes() {
        let err = FlashError::precondition(Precondition::WrongMode {
            required: "fastboot",
            actual: DeviceMode::Adb,
        });
        let msg = err.to_string();
        assert!(msg.contains("fastboot"));
        assert!(msg.contains("adb"));
        assert!(err.is_precondition());
    }

    #[test]
    fn test_partial_failure_lists_partitions() {
        let err = FlashError::PartialFailure {
            succeeded: vec!["boot_a".to_string()],
            failed: vec!["boot_b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "partial failure: flashed [boot_a], failed [boot_b]"
        );
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FlashError = io.into();
        assert!(matches!(err, FlashError::Io(_)));
    }
}
