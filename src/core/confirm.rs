//! User-safety gate for destructive operations

use crate::core::error::{FlashError, Result};
use log::warn;

/// Asked once before wiping, unlocking or restoring
pub trait ConfirmGate {
    /// Return true to proceed with `action`
    fn confirm(&self, action: &str) -> bool;
}

/// `--force`: always proceed
#[derive(Debug, Clone, Copy, Default)]
pub struct Forced;

impl ConfirmGate for Forced {
    fn confirm(&self, _action: &str) -> bool {
        true
    }
}

/// Always decline (non-interactive sessions without `--force`)
#[derive(Debug, Clone, Copy, Default)]
pub struct Refuse;

impl ConfirmGate for Refuse {
    fn confirm(&self, action: &str) -> bool {
        warn!("Refusing to {} without confirmation (use --force)", action);
        false
    }
}

/// Ask the gate; a decline becomes `FlashError::Cancelled`
pub fn require(gate: &dyn ConfirmGate, action: &str) -> Result<()> {
    if gate.confirm(action) {
        Ok(())
    } else {
        Err(FlashError::Cancelled(format!("{} aborted by user", action)))
    }
}
