//! Core functionality module
//!
//! This module contains the flashing engine proper: configuration, error
//! handling, the flash dispatcher and its slot strategy, and the collaborator
//! operations (download, wipe, unlock, backup/restore) built on the same
//! transport.
//!
//! # Submodules
//!
//! - `config` - Configuration loading, saving, and management
//! - `error` - Error types and result aliases
//! - `archive` - ROM archive extraction into self-removing scratch directories
//! - `slot` - Slot suffix fallback for partition flashes
//! - `flash` - Flash dispatcher and per-target strategies
//! - `downloader` - Resumable HTTP downloads with SHA-256 or MD5 verification
//! - `confirm` - Confirmation gate for destructive operations
//! - `wipe` - Userdata / cache / dalvik wipes
//! - `unlock` - Bootloader unlock through an external tool or fastboot
//! - `backup` - Partition backup and restore
//! - `session` - Per-run JSON-lines session logs

pub mod archive;
pub mod backup;
pub mod config;
pub mod confirm;
pub mod downloader;
pub mod error;
pub mod flash;
pub mod session;
pub mod slot;
pub mod unlock;
pub mod wipe;
