//! Device state detection
//!
//! Probes the backends leaves-first and builds a [`DeviceRecord`] from the
//! first one that answers:
//!
//! 1. OS shell (`adb devices`), ignoring offline entries → `adb` / `recovery`
//! 2. Bootloader shell (`fastboot devices`) → `fastboot` / `fastbootd`
//! 3. Raw USB enumeration → `usb-unknown`, serial only
//! 4. Nothing → `None`, which is a valid outcome and not an error
//!
//! Each gatherer owns the [`RecordBuilder`] it fills, so a record can never
//! combine properties read through two different backends.

use crate::device::record::{DeviceMode, DeviceRecord, LockState, RecordBuilder, SINGLE_SLOT};
use crate::device::transport::{probe, Backend, Invocation, Transport};
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;

static BATTERY_LEVEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"level:\s*(\d+)").unwrap());
static BATTERY_STATUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"status:\s*(\d+)").unwrap());
static MEM_TOTAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"MemTotal:\s*(\d+)").unwrap());
static MEM_AVAILABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"MemAvailable:\s*(\d+)").unwrap());
static DISPLAY_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+x\d+)").unwrap());
static DISPLAY_DENSITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").unwrap());

/// A device line from `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbEntry {
    pub serial: String,
    pub state: String,
}

/// Parse `adb devices` output, dropping the header and offline entries
pub fn parse_adb_devices(output: &str) -> Vec<AdbEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            let serial = words.next()?;
            let state = words.next().unwrap_or("device");
            Some(AdbEntry {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .filter(|entry| entry.state != "offline")
        .collect()
}

/// Parse `fastboot devices` output into serials
pub fn parse_fastboot_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|serial| !serial.starts_with('<') && !serial.starts_with('('))
        .map(str::to_string)
        .collect()
}

/// First device reported by the USB enumerator.
///
/// `termux-usb -l` prints a JSON array of device paths; anything else is
/// taken line by line.
pub fn parse_usb_list(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed.starts_with('[') {
        if let Ok(paths) = serde_json::from_str::<Vec<String>>(trimmed) {
            return paths.into_iter().map(|p| p.trim().to_string()).find(|p| !p.is_empty());
        }
    }
    trimmed
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Value of one bootloader variable from `fastboot getvar` text.
///
/// Tolerates `(bootloader) ` prefixes and the trailing timing line.
pub fn parse_getvar(output: &str, var: &str) -> Option<String> {
    let key = format!("{}:", var);
    output
        .lines()
        .map(|line| line.trim().trim_start_matches("(bootloader)").trim())
        .find_map(|line| line.strip_prefix(&key).map(str::trim))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn battery_status_label(code: &str) -> &'static str {
    match code {
        "1" => "Unknown",
        "2" => "Charging",
        "3" => "Discharging",
        "4" => "Not charging",
        "5" => "Full",
        _ => "?",
    }
}

/// `dumpsys battery` → `"87% (Charging)"`
pub fn parse_battery(dump: &str) -> Option<String> {
    let level = BATTERY_LEVEL.captures(dump)?.get(1)?.as_str();
    let status = BATTERY_STATUS
        .captures(dump)
        .and_then(|c| c.get(1))
        .map(|m| battery_status_label(m.as_str()))
        .unwrap_or("?");
    Some(format!("{}% ({})", level, status))
}

/// `df /data` → `"<used> MB used / <free> MB free"` (input in 1K blocks)
pub fn parse_storage(df: &str) -> Option<String> {
    let line = df.lines().find(|line| line.contains("/data"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let used = parts[2].parse::<u64>().ok()? / 1024;
    let free = parts[3].parse::<u64>().ok()? / 1024;
    Some(format!("{} MB used / {} MB free", used, free))
}

/// `/proc/meminfo` → `"<avail> MB free / <total> MB total"`
pub fn parse_memory(meminfo: &str) -> Option<String> {
    let read = |re: &Regex| -> Option<u64> { re.captures(meminfo)?.get(1)?.as_str().parse().ok() };
    let total = read(&MEM_TOTAL)? / 1024;
    let available = read(&MEM_AVAILABLE)? / 1024;
    Some(format!("{} MB free / {} MB total", available, total))
}

/// `wm size` + `wm density` → `"1080x2400 @ 440 DPI"`
pub fn parse_display(size: &str, density: &str) -> Option<String> {
    let geometry = DISPLAY_SIZE.captures(size)?.get(1)?.as_str();
    match DISPLAY_DENSITY.captures(density).and_then(|c| c.get(1)) {
        Some(dpi) => Some(format!("{} @ {} DPI", geometry, dpi.as_str())),
        None => Some(geometry.to_string()),
    }
}

/// Runs the probe sequence against one transport
pub struct DeviceDetector<'a> {
    transport: &'a dyn Transport,
}

impl<'a> DeviceDetector<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        Self { transport }
    }

    /// Detect the connected device. Every call re-probes from scratch.
    pub fn detect(&self) -> Option<DeviceRecord> {
        if let Some(record) = self.detect_adb() {
            return Some(record);
        }
        if let Some(record) = self.detect_fastboot() {
            return Some(record);
        }
        if let Some(record) = self.detect_usb() {
            return Some(record);
        }
        debug!("No device answered any backend");
        None
    }

    /// Current mode only, without gathering properties
    pub fn current_mode(&self) -> DeviceMode {
        if let Ok(out) = probe(self.transport, Backend::Adb) {
            if let Some(entry) = parse_adb_devices(&out.stdout).into_iter().next() {
                return adb_mode(&entry.state);
            }
        }
        if let Ok(out) = probe(self.transport, Backend::Fastboot) {
            if !parse_fastboot_devices(&out.text()).is_empty() {
                return self.fastboot_mode();
            }
        }
        if let Ok(out) = probe(self.transport, Backend::UsbEnum) {
            if parse_usb_list(&out.stdout).is_some() {
                return DeviceMode::UsbUnknown;
            }
        }
        DeviceMode::None
    }

    fn detect_adb(&self) -> Option<DeviceRecord> {
        let out = probe(self.transport, Backend::Adb).ok()?;
        let entry = parse_adb_devices(&out.stdout).into_iter().next()?;
        let mode = adb_mode(&entry.state);
        debug!("adb reports {} ({})", entry.serial, entry.state);
        Some(self.gather_adb(&entry.serial, mode))
    }

    fn detect_fastboot(&self) -> Option<DeviceRecord> {
        let out = probe(self.transport, Backend::Fastboot).ok()?;
        let serial = parse_fastboot_devices(&out.text()).into_iter().next()?;
        debug!("fastboot reports {}", serial);
        Some(self.gather_fastboot(&serial))
    }

    fn detect_usb(&self) -> Option<DeviceRecord> {
        let out = probe(self.transport, Backend::UsbEnum).ok()?;
        let serial = parse_usb_list(&out.stdout)?;
        debug!("USB enumerator reports {}", serial);
        Some(RecordBuilder::new(&serial, DeviceMode::UsbUnknown).build())
    }

    /// Text of an OS-shell command, empty when it fails
    fn adb_text(&self, args: &[&str]) -> String {
        match self.transport.run(&Invocation::adb(args.iter().copied())) {
            Ok(out) => out.stdout.trim().to_string(),
            Err(u) => {
                trace!("{}", u.diagnostics());
                String::new()
            }
        }
    }

    fn getprop(&self, prop: &str) -> String {
        self.adb_text(&["shell", "getprop", prop])
    }

    fn getvar(&self, var: &str) -> Option<String> {
        let out = self.transport.run(&Invocation::fastboot(["getvar", var])).ok()?;
        parse_getvar(&out.text(), var)
    }

    fn fastboot_mode(&self) -> DeviceMode {
        match self.getvar("is-userspace").as_deref() {
            Some("yes") => DeviceMode::Fastbootd,
            _ => DeviceMode::Fastboot,
        }
    }

    /// Populate a record through the OS-shell backend
    pub fn gather_adb(&self, serial: &str, mode: DeviceMode) -> DeviceRecord {
        let mut builder = RecordBuilder::new(serial, mode);

        builder
            .brand(self.getprop("ro.product.brand"))
            .model(self.getprop("ro.product.model"))
            .codename(self.getprop("ro.product.device"))
            .os_version(self.getprop("ro.build.version.release"))
            .build_id(self.getprop("ro.build.display.id"))
            .security_patch(self.getprop("ro.build.version.security_patch"))
            .cpu_abi(self.getprop("ro.product.cpu.abi"));

        let kernel = self.getprop("ro.kernel.version");
        if kernel.is_empty() {
            builder.kernel(self.adb_text(&["shell", "uname", "-r"]));
        } else {
            builder.kernel(kernel);
        }

        if let Some(battery) = parse_battery(&self.adb_text(&["shell", "dumpsys", "battery"])) {
            builder.battery(battery);
        }

        let slot = self.getprop("ro.boot.slot_suffix");
        builder.slot(if slot.is_empty() { SINGLE_SLOT } else { slot.as_str() });

        builder.bootloader(LockState::from_boot_props(
            &self.getprop("ro.boot.verifiedbootstate"),
            &self.getprop("ro.boot.flash.locked"),
        ));

        if let Some(storage) = parse_storage(&self.adb_text(&["shell", "df", "/data"])) {
            builder.storage(storage);
        }
        if let Some(memory) = parse_memory(&self.adb_text(&["shell", "cat", "/proc/meminfo"])) {
            builder.memory(memory);
        }
        let size = self.adb_text(&["shell", "wm", "size"]);
        let density = self.adb_text(&["shell", "wm", "density"]);
        if let Some(display) = parse_display(&size, &density) {
            builder.display(display);
        }

        builder.build()
    }

    /// Populate a record through the bootloader backend
    pub fn gather_fastboot(&self, serial: &str) -> DeviceRecord {
        let mode = self.fastboot_mode();
        let mut builder = RecordBuilder::new(serial, mode);

        if let Some(product) = self.getvar("product") {
            builder.codename(product);
        }
        if let Some(baseband) = self.getvar("version-baseband") {
            builder.build_id(baseband);
        }
        match self.getvar("current-slot") {
            Some(slot) => {
                builder.slot(format!("_{}", slot.trim_start_matches('_')));
            }
            None => {
                if let Some(count) = self.getvar("slot-count") {
                    builder.slot(count);
                }
            }
        }
        builder.bootloader(
            self.getvar("unlocked")
                .map(|v| LockState::from_unlocked_var(&v))
                .unwrap_or(LockState::Unknown),
        );

        builder.build()
    }
}

fn adb_mode(state: &str) -> DeviceMode {
    if state == "recovery" {
        DeviceMode::Recovery
    } else {
        DeviceMode::Adb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::record::{FIELD_NAMES, UNKNOWN};
    use crate::testdb::{MockTransport, ScenarioLibrary};

    #[test]
    fn test_parse_adb_devices_skips_header_and_offline() {
        let out = "List of devices attached\nABC123\tdevice\nDEF456\toffline\n\n";
        let entries = parse_adb_devices(out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].serial, "ABC123");
        assert_eq!(entries[0].state, "device");

        let only_offline = "List of devices attached\nDEF456\toffline\n";
        assert!(parse_adb_devices(only_offline).is_empty());
        assert!(parse_adb_devices("* daemon started successfully\nList of devices attached\n").is_empty());
    }

    #[test]
    fn test_parse_fastboot_devices() {
        assert_eq!(parse_fastboot_devices("XYZ789\tfastboot\n"), vec!["XYZ789"]);
        assert!(parse_fastboot_devices("").is_empty());
    }

    #[test]
    fn test_parse_usb_list() {
        assert_eq!(
            parse_usb_list("[\n  \"/dev/bus/usb/001/002\"\n]\n").as_deref(),
            Some("/dev/bus/usb/001/002")
        );
        assert_eq!(parse_usb_list("[]"), None);
        assert_eq!(parse_usb_list("  \n"), None);
        assert_eq!(parse_usb_list("/dev/bus/usb/001/003\n").as_deref(), Some("/dev/bus/usb/001/003"));
    }

    #[test]
    fn test_parse_getvar_variants() {
        assert_eq!(
            parse_getvar("unlocked: no\nFinished. Total time: 0.001s", "unlocked").as_deref(),
            Some("no")
        );
        assert_eq!(
            parse_getvar("(bootloader) current-slot: a\nOKAY [  0.001s]", "current-slot").as_deref(),
            Some("a")
        );
        assert_eq!(parse_getvar("slot-count: \nFinished.", "slot-count"), None);
        // A variable whose name is a prefix of another must not match it
        assert_eq!(parse_getvar("slot-count: 2", "slot"), None);
    }

    #[test]
    fn test_parse_battery() {
        let dump = "Current Battery Service state:\n  AC powered: false\n  status: 2\n  health: 2\n  level: 87\n  scale: 100\n";
        assert_eq!(parse_battery(dump).as_deref(), Some("87% (Charging)"));
        assert_eq!(parse_battery("level: 40\nstatus: 9").as_deref(), Some("40% (?)"));
        assert_eq!(parse_battery("level: 40").as_deref(), Some("40% (?)"));
        assert_eq!(parse_battery("no battery here"), None);
    }

    #[test]
    fn test_parse_storage_and_memory() {
        let df = "Filesystem     1K-blocks    Used Available Use% Mounted on\n/dev/block/dm-5 115609024 52428800 63180224  46% /data\n";
        assert_eq!(
            parse_storage(df).as_deref(),
            Some("51200 MB used / 61699 MB free")
        );
        assert_eq!(parse_storage("garbage /data"), None);

        let meminfo = "MemTotal:        7802064 kB\nMemFree:          302024 kB\nMemAvailable:    3145728 kB\n";
        assert_eq!(parse_memory(meminfo).as_deref(), Some("3072 MB free / 7619 MB total"));
        assert_eq!(parse_memory("MemTotal: 1024 kB"), None);
    }

    #[test]
    fn test_parse_display() {
        assert_eq!(
            parse_display("Physical size: 1080x2400", "Physical density: 440").as_deref(),
            Some("1080x2400 @ 440 DPI")
        );
        assert_eq!(parse_display("Physical size: 1080x2400", "").as_deref(), Some("1080x2400"));
        assert_eq!(parse_display("", "Physical density: 440"), None);
    }

    #[test]
    fn test_detect_adb_scenario() {
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\nABC123\tdevice\n")
            .respond("adb shell getprop ro.product.brand", "Xiaomi\n")
            .respond("adb shell getprop ro.product.model", "Redmi Note 12\n")
            .respond("adb shell dumpsys battery", "  level: 87\n  status: 2\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();

        assert_eq!(record.mode(), DeviceMode::Adb);
        assert_eq!(record.serial(), "ABC123");
        assert_eq!(record.brand(), "Xiaomi");
        assert_eq!(record.model(), "Redmi Note 12");
        assert_eq!(record.battery(), "87% (Charging)");
        assert_eq!(record.slot(), SINGLE_SLOT);
        assert_eq!(record.codename(), UNKNOWN);
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_detect_fastboot_scenario() {
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\n")
            .respond("fastboot devices", "XYZ789\tfastboot\n")
            .respond_stderr("fastboot getvar unlocked", "unlocked: no\nFinished. Total time: 0.001s\n")
            .respond_stderr("fastboot getvar current-slot", "current-slot: b\n")
            .respond_stderr("fastboot getvar product", "product: ruby\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();

        assert_eq!(record.mode(), DeviceMode::Fastboot);
        assert_eq!(record.serial(), "XYZ789");
        assert_eq!(record.bootloader().label(), "no (locked)");
        assert_eq!(record.slot(), "_b");
        assert_eq!(record.codename(), "ruby");
        assert_eq!(record.brand(), UNKNOWN);
    }

    #[test]
    fn test_detect_fastbootd() {
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\n")
            .respond("fastboot devices", "XYZ789\tfastboot\n")
            .respond_stderr("fastboot getvar is-userspace", "is-userspace: yes\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();
        assert_eq!(record.mode(), DeviceMode::Fastbootd);
        assert_eq!(DeviceDetector::new(&mock).current_mode(), DeviceMode::Fastbootd);
    }

    #[test]
    fn test_detect_recovery() {
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\nABC123\trecovery\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();
        assert_eq!(record.mode(), DeviceMode::Recovery);
    }

    #[test]
    fn test_adb_never_yields_fastboot() {
        // Both backends answer; adb has priority
        for state in ["device", "recovery", "sideload", "unauthorized"] {
            let mock = MockTransport::new()
                .respond("adb devices", &format!("List of devices attached\nABC123\t{}\n", state))
                .respond("fastboot devices", "XYZ789\tfastboot\n");
            let mode = DeviceDetector::new(&mock).detect().unwrap().mode();
            assert!(
                mode == DeviceMode::Adb || mode == DeviceMode::Recovery,
                "state {} gave {}",
                state,
                mode
            );
        }
    }

    #[test]
    fn test_offline_adb_falls_through_to_usb() {
        let mock = MockTransport::strict()
            .respond("adb devices", "List of devices attached\nABC123\toffline\n")
            .respond("fastboot devices", "")
            .respond("termux-usb -l", "[\"/dev/bus/usb/001/002\"]\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();
        assert_eq!(record.mode(), DeviceMode::UsbUnknown);
        assert_eq!(record.serial(), "/dev/bus/usb/001/002");
        assert_eq!(record.brand(), UNKNOWN);
    }

    #[test]
    fn test_no_device_when_all_backends_unavailable() {
        let mock = MockTransport::strict();
        assert!(DeviceDetector::new(&mock).detect().is_none());
        assert_eq!(DeviceDetector::new(&mock).current_mode(), DeviceMode::None);
    }

    #[test]
    fn test_kernel_falls_back_to_uname() {
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\nABC123\tdevice\n")
            .respond("adb shell uname -r", "5.10.168-android12-9\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();
        assert_eq!(record.kernel(), "5.10.168-android12-9");
    }

    #[test]
    fn test_fully_populated_record_has_every_field() {
        let mock = ScenarioLibrary::adb_full("ABC123");
        let record = DeviceDetector::new(&mock).detect().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object.len(), FIELD_NAMES.len());
        for key in FIELD_NAMES {
            let value = object.get(key).unwrap_or_else(|| panic!("missing {}", key));
            assert!(value.is_string(), "{} is not a string", key);
            assert_ne!(value.as_str(), Some(UNKNOWN), "{} was not populated", key);
        }
        assert_eq!(object["bootloader"], "yes (unlocked)");
        assert_eq!(object["mode"], "adb");
    }

    #[test]
    fn test_empty_property_set_uses_sentinel() {
        let mock = MockTransport::new()
            .respond("adb devices", "List of devices attached\nABC123\tdevice\n");
        let record = DeviceDetector::new(&mock).detect().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), FIELD_NAMES.len());
        assert_eq!(object["brand"], UNKNOWN);
        assert_eq!(object["bootloader"], UNKNOWN);
    }
}
