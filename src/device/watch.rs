//! Watch mode: poll detection and report connection transitions
//!
//! Each tick runs a full detection. An event is emitted only when the
//! `(serial, mode)` pair differs from the previous tick, so a device that
//! reboots from adb into the bootloader is reported even though its serial
//! stays the same.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use crate::device::detector::DeviceDetector;
use crate::device::record::{DeviceMode, DeviceRecord};
use crate::device::transport::Transport;

/// Granularity of the shutdown check while sleeping between polls
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// A change in what is connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A device appeared where there was none
    Connected(DeviceRecord),
    /// The previous device is gone
    Disconnected { serial: String, mode: DeviceMode },
    /// A device is present but its serial or mode changed
    Changed {
        from_serial: String,
        from_mode: DeviceMode,
        record: DeviceRecord,
    },
}

/// Configuration for the watcher
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// How often to poll (in milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
        }
    }
}

impl WatchConfig {
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Transition tracker; holds only the previous `(serial, mode)` pair
#[derive(Debug, Default)]
pub struct DeviceWatcher {
    last: Option<(String, DeviceMode)>,
}

impl DeviceWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one detection result; returns an event on transitions only
    pub fn observe(&mut self, current: Option<DeviceRecord>) -> Option<WatchEvent> {
        let key = current
            .as_ref()
            .map(|r| (r.serial().to_string(), r.mode()));
        if key == self.last {
            return None;
        }

        let previous = std::mem::replace(&mut self.last, key);
        match (previous, current) {
            (None, Some(record)) => Some(WatchEvent::Connected(record)),
            (Some((serial, mode)), None) => Some(WatchEvent::Disconnected { serial, mode }),
            (Some((from_serial, from_mode)), Some(record)) => Some(WatchEvent::Changed {
                from_serial,
                from_mode,
                record,
            }),
            (None, None) => None,
        }
    }

    /// Run one detection and observe it
    pub fn tick(&mut self, transport: &dyn Transport) -> Option<WatchEvent> {
        self.observe(DeviceDetector::new(transport).detect())
    }

    /// Poll on the calling thread until `shutdown` is set
    pub fn run<F>(
        &mut self,
        transport: &dyn Transport,
        config: &WatchConfig,
        shutdown: &AtomicBool,
        mut on_event: F,
    ) where
        F: FnMut(WatchEvent),
    {
        info!("Watching for device changes every {}ms", config.poll_interval_ms);
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(event) = self.tick(transport) {
                on_event(event);
            }
            sleep_unless(shutdown, config.interval());
        }
        debug!("Watch stopped");
    }
}

fn sleep_unless(shutdown: &AtomicBool, total: Duration) {
    let mut left = total;
    while !left.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let step = left.min(SLEEP_SLICE);
        thread::sleep(step);
        left -= step;
    }
}

/// Background watcher delivering events over a channel
pub struct WatchHandle {
    shutdown_flag: Arc<AtomicBool>,
    event_rx: Receiver<WatchEvent>,
    thread_handle: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Start polling on a background thread
    pub fn spawn<T>(transport: Arc<T>, config: WatchConfig) -> Self
    where
        T: Transport + 'static,
    {
        let (event_tx, event_rx): (Sender<WatchEvent>, Receiver<WatchEvent>) = mpsc::channel();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);

        let handle = thread::spawn(move || {
            let mut watcher = DeviceWatcher::new();
            watcher.run(transport.as_ref(), &config, &flag, |event| {
                // Receiver dropped means nobody is listening any more
                if event_tx.send(event).is_err() {
                    flag.store(true, Ordering::SeqCst);
                }
            });
        });

        Self {
            shutdown_flag,
            event_rx,
            thread_handle: Some(handle),
        }
    }

    /// Try to receive the next event (non-blocking)
    pub fn try_recv(&self) -> Option<WatchEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Receive event with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WatchEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Stop the background thread and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdb::MockTransport;

    const ADB_ABC: &str = "List of devices attached\nABC123\tdevice\n";
    const ADB_NONE: &str = "List of devices attached\n";

    #[test]
    fn test_only_transitions_are_reported() {
        let mock = MockTransport::strict()
            .respond_times("adb devices", ADB_NONE, 1)
            .respond_times("adb devices", ADB_ABC, 2)
            .respond("adb devices", ADB_NONE)
            .respond("adb shell", "");

        let mut watcher = DeviceWatcher::new();
        assert_eq!(watcher.tick(&mock), None);
        assert!(matches!(watcher.tick(&mock), Some(WatchEvent::Connected(r)) if r.serial() == "ABC123"));
        assert_eq!(watcher.tick(&mock), None);
        assert_eq!(
            watcher.tick(&mock),
            Some(WatchEvent::Disconnected {
                serial: "ABC123".to_string(),
                mode: DeviceMode::Adb
            })
        );
        assert_eq!(watcher.tick(&mock), None);
    }

    #[test]
    fn test_mode_change_with_same_serial_is_reported() {
        let mock = MockTransport::strict()
            .respond_times("adb devices", ADB_ABC, 1)
            .respond("adb devices", ADB_NONE)
            .respond("adb shell", "")
            .respond("fastboot devices", "ABC123\tfastboot\n")
            .respond("fastboot getvar", "");

        let mut watcher = DeviceWatcher::new();
        assert!(matches!(watcher.tick(&mock), Some(WatchEvent::Connected(_))));
        match watcher.tick(&mock) {
            Some(WatchEvent::Changed {
                from_serial,
                from_mode,
                record,
            }) => {
                assert_eq!(from_serial, "ABC123");
                assert_eq!(from_mode, DeviceMode::Adb);
                assert_eq!(record.serial(), "ABC123");
                assert_eq!(record.mode(), DeviceMode::Fastboot);
            }
            other => panic!("expected mode change, got {:?}", other),
        }
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let mock = MockTransport::strict();
        let shutdown = AtomicBool::new(true);
        let mut calls = 0;
        DeviceWatcher::new().run(&mock, &WatchConfig::default(), &shutdown, |_| calls += 1);
        assert_eq!(calls, 0);
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_background_handle_delivers_events() {
        let mock = Arc::new(
            MockTransport::strict()
                .respond("adb devices", ADB_ABC)
                .respond("adb shell", ""),
        );
        let handle = WatchHandle::spawn(Arc::clone(&mock), WatchConfig::default().with_poll_interval(10));
        let event = handle.recv_timeout(Duration::from_secs(5));
        assert!(matches!(event, Some(WatchEvent::Connected(_))));
        handle.stop();
        assert!(mock.count("adb devices") >= 1);
    }
}
