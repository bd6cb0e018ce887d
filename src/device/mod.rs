//! Device interaction module
//!
//! Everything that talks to the phone goes through the command-line backends
//! (`adb`, `fastboot`, the raw USB enumerator) behind the [`Transport`] trait.
//!
//! # Submodules
//!
//! - `transport` - Backend invocation with timeouts, normalized output
//! - `record` - Canonical device record and mode/lock enums
//! - `detector` - Ordered backend probing and property gathering
//! - `reboot` - Reboot target to backend command mapping
//! - `watch` - Polling loop reporting connect/disconnect/mode changes
//!
//! # Architecture
//!
//! The real [`SystemTransport`] spawns processes; the mock in
//! [`crate::testdb`] answers from a rule table. Detection, flashing and every
//! other operation take `&dyn Transport`, so they run unchanged against
//! either.

pub mod detector;
pub mod reboot;
pub mod record;
pub mod transport;
pub mod watch;

pub use detector::DeviceDetector;
pub use reboot::{reboot_device, reboot_invocation, RebootTarget};
pub use record::{DeviceMode, DeviceRecord, LockState, FIELD_NAMES, UNKNOWN};
pub use transport::{
    probe, Backend, Invocation, ProbeResult, RawOutput, SystemTransport, Transport, Unavailable,
    UnavailableKind,
};
pub use watch::{DeviceWatcher, WatchConfig, WatchEvent, WatchHandle};
