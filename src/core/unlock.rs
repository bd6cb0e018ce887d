//! Bootloader unlock
//!
//! Authorization is entirely the external tool's business. All we get back
//! is an exit code and some text, classified here into three outcomes. An
//! authorization rejection is reported as such even when the tool exits 0.

use crate::core::config::ToolsConfig;
use crate::core::confirm::{self, ConfirmGate};
use crate::core::error::{FlashError, Precondition, Result};
use crate::device::detector::DeviceDetector;
use crate::device::record::DeviceMode;
use crate::device::transport::{Invocation, Transport, UnavailableKind, FLASH_TIMEOUT};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt::{self, Display};

static UNAUTHORIZED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b401\b|unauthori[sz]ed|not authori[sz]ed|couldn'?t verify|account (is )?not (bound|linked)")
        .unwrap()
});

static FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bFAILED\b|\berror\b|denied|not allowed").unwrap());

static SUCCESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)unlock(ed)? success|successfully unlocked|\bOKAY\b").unwrap());

/// Options for one unlock attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockOptions {
    /// Passed to the unlock tool as `--token <token>`
    pub token: Option<String>,
    /// Skip the tool and send `fastboot flashing unlock`
    pub fastboot_only: bool,
}

/// How an unlock attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "output", rename_all = "lowercase")]
pub enum UnlockOutcome {
    Unlocked,
    /// The tool said the account or token is not allowed to unlock
    Unauthorized(String),
    Failed(String),
}

impl UnlockOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnlockOutcome::Unlocked)
    }

    /// Classify an exit status plus the captured text
    pub fn classify(exit_ok: bool, text: &str) -> Self {
        if UNAUTHORIZED.is_match(text) {
            return UnlockOutcome::Unauthorized(text.to_string());
        }
        if !exit_ok || (FAILURE.is_match(text) && !SUCCESS.is_match(text)) {
            return UnlockOutcome::Failed(text.to_string());
        }
        UnlockOutcome::Unlocked
    }
}

impl Display for UnlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockOutcome::Unlocked => write!(f, "bootloader unlocked"),
            UnlockOutcome::Unauthorized(_) => {
                write!(f, "unlock not authorized for this account or token")
            }
            UnlockOutcome::Failed(text) if text.is_empty() => write!(f, "unlock failed"),
            UnlockOutcome::Failed(text) => write!(f, "unlock failed: {}", text),
        }
    }
}

fn tool_invocation(tools: &ToolsConfig, options: &UnlockOptions) -> Invocation {
    let mut args = Vec::new();
    if let Some(ref token) = options.token {
        args.push("--token".to_string());
        args.push(token.clone());
    }
    Invocation::external(&tools.unlock_tool, args).with_timeout(FLASH_TIMEOUT)
}

/// Unlock the bootloader after confirmation. Unlocking wipes user data.
pub fn unlock(
    transport: &dyn Transport,
    tools: &ToolsConfig,
    options: &UnlockOptions,
    gate: &dyn ConfirmGate,
) -> Result<UnlockOutcome> {
    warn!("Unlocking the bootloader WILL wipe all user data");
    confirm::require(gate, "unlock the bootloader")?;

    let invocation = if options.fastboot_only {
        match DeviceDetector::new(transport).current_mode() {
            mode if mode.is_bootloader() => {}
            DeviceMode::None => return Err(FlashError::precondition(Precondition::NoDevice)),
            actual => {
                return Err(FlashError::precondition(Precondition::WrongMode {
                    required: "fastboot",
                    actual,
                }))
            }
        }
        Invocation::fastboot(["flashing", "unlock"]).with_timeout(FLASH_TIMEOUT)
    } else {
        tool_invocation(tools, options)
    };

    info!("Running {}", invocation);
    let outcome = match transport.run(&invocation) {
        Ok(out) => UnlockOutcome::classify(true, &out.text()),
        Err(u) if u.kind == UnavailableKind::NotInstalled => {
            return Err(FlashError::precondition(Precondition::ToolMissing {
                candidates: vec![invocation.program.label().to_string()],
                hint: "Install the unlock tool, set tools.unlock_tool, or use --fastboot-only"
                    .to_string(),
            }))
        }
        Err(u) => UnlockOutcome::classify(false, &u.output.text()),
    };

    match outcome {
        UnlockOutcome::Unlocked => info!("Bootloader unlocked"),
        UnlockOutcome::Unauthorized(_) => error!("Unlock rejected: not authorized"),
        UnlockOutcome::Failed(ref text) => error!("Unlock failed: {}", text),
    }
    Ok(outcome)
}
