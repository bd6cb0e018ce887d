//! miflasher library
//!
//! Device-mode detection and firmware flashing for Android phones, driven
//! through the `adb`, `fastboot` and USB-enumeration command-line tools.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`device`] - Backend invocation, mode detection, the device record,
//!   reboot mapping and watch mode
//! - [`core`] - Configuration, error handling, the flash dispatcher with its
//!   slot fallback, and the download / wipe / unlock / backup operations
//! - [`cli`] - Command-line interface (only used by the binary)
//! - [`testdb`] - Scripted transport and device scenarios for testing
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use miflasher::core::config::Config;
//! use miflasher::core::flash::{FlashManager, FlashOptions, FlashSource, FlashTarget};
//! use miflasher::device::{DeviceDetector, SystemTransport};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let transport = SystemTransport::new(config.tools.clone());
//!
//!     if let Some(record) = DeviceDetector::new(&transport).detect() {
//!         println!("{}", record.summary());
//!     }
//!
//!     let outcome = FlashManager::new(&transport, &config).flash(
//!         FlashTarget::Boot,
//!         &FlashSource::parse("boot.img"),
//!         &FlashOptions::from_config(&config.flash),
//!     )?;
//!     outcome.check()?;
//!     Ok(())
//! }
//! ```
//!
//! # Testing Without a Device
//!
//! ```rust,no_run
//! use miflasher::testdb::TestRunner;
//!
//! let mut runner = TestRunner::new();
//! let summary = runner.run_quick();
//! println!("Passed: {}/{}", summary.passed, summary.total);
//!
//! miflasher::testdb::print_available_scenarios();
//! ```

pub mod cli;
pub mod core;
pub mod device;
pub mod testdb;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
