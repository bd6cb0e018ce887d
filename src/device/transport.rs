//! Transport probe: one uniform way to invoke the command-line backends
//!
//! Every interaction with the phone goes through a [`Transport`]. The real
//! implementation ([`SystemTransport`]) spawns `adb`, `fastboot`, the USB
//! enumerator or an external tool with a per-command timeout; tests use
//! [`crate::testdb::MockTransport`].
//!
//! Absence is a normal outcome: a missing binary, a timeout and a non-zero
//! exit are all folded into [`Unavailable`], carrying whatever text the
//! process printed so callers can decide whether to fall back or give up.

use crate::core::config::ToolsConfig;
use crate::core::error::FlashError;
use log::{debug, trace};
use std::fmt::{self, Display};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Timeout for detection probes and property reads
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Timeout for commands that transfer image data
pub const FLASH_TIMEOUT: Duration = Duration::from_secs(300);

/// How often a running child is polled for completion
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The command-line backends a device can be reached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// OS-shell backend (`adb`)
    Adb,
    /// Bootloader-shell backend (`fastboot`)
    Fastboot,
    /// Raw USB enumeration (`termux-usb -l`)
    UsbEnum,
}

impl Backend {
    /// Default program name for this backend
    pub fn default_program(&self) -> &'static str {
        match self {
            Backend::Adb => "adb",
            Backend::Fastboot => "fastboot",
            Backend::UsbEnum => "termux-usb",
        }
    }

    /// Arguments that list connected devices
    pub fn list_args(&self) -> &'static [&'static str] {
        match self {
            Backend::Adb | Backend::Fastboot => &["devices"],
            Backend::UsbEnum => &["-l"],
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_program())
    }
}

/// What an invocation runs: one of the backends or an arbitrary tool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Program {
    Backend(Backend),
    External(String),
}

impl Program {
    /// Short name used in logs and mock matching
    pub fn label(&self) -> &str {
        match self {
            Program::Backend(b) => b.default_program(),
            Program::External(name) => name,
        }
    }
}

/// One fully specified external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: Program,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    /// Command against a backend with the probe timeout
    pub fn backend<I, S>(backend: Backend, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::Backend(backend),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn adb<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::backend(Backend::Adb, args)
    }

    pub fn fastboot<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::backend(Backend::Fastboot, args)
    }

    /// Command against an external tool (script interpreter, dumper, unlocker)
    pub fn external<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::External(program.to_string()),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// The command line as a list of words, program first
    pub fn words(&self) -> Vec<&str> {
        std::iter::once(self.program.label())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }

    /// Whether this command can change device state.
    ///
    /// Listing, property reads, `getvar`, `fetch` and `pull` are read-only;
    /// everything else (flash, erase, reboot, oem, scripts, shell rm) is not.
    pub fn is_mutating(&self) -> bool {
        let first = self.args.first().map(String::as_str).unwrap_or("");
        match &self.program {
            Program::Backend(Backend::UsbEnum) => false,
            Program::Backend(Backend::Adb) => match first {
                "devices" | "pull" | "get-state" => false,
                "shell" => !matches!(
                    self.args.get(1).map(String::as_str),
                    Some("getprop" | "dumpsys" | "df" | "cat" | "wm" | "ls" | "uname")
                ),
                _ => true,
            },
            Program::Backend(Backend::Fastboot) => {
                !matches!(first, "devices" | "getvar" | "fetch")
            }
            Program::External(_) => true,
        }
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.words().join(" "))
    }
}

/// Captured text of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr, trimmed. fastboot answers `getvar` on stderr.
    pub fn text(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(self.stdout.trim_end());
        if !self.stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(self.stderr.trim_end());
        }
        combined.trim().to_string()
    }
}

/// Why a command produced no usable output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableKind {
    /// Program not found on PATH
    NotInstalled,
    /// Killed after exceeding its timeout
    TimedOut(Duration),
    /// Exited with a non-zero status (None when killed by a signal)
    Exit(Option<i32>),
    /// Spawn or pipe failure
    Io(String),
}

impl Display for UnavailableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableKind::NotInstalled => write!(f, "not installed"),
            UnavailableKind::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
            UnavailableKind::Exit(Some(code)) => write!(f, "exit code {}", code),
            UnavailableKind::Exit(None) => write!(f, "terminated by signal"),
            UnavailableKind::Io(msg) => write!(f, "{}", msg),
        }
    }
}

/// A command that did not succeed, with its captured diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unavailable {
    pub command: String,
    pub kind: UnavailableKind,
    pub output: RawOutput,
}

impl Unavailable {
    pub fn new(invocation: &Invocation, kind: UnavailableKind, output: RawOutput) -> Self {
        Self {
            command: invocation.to_string(),
            kind,
            output,
        }
    }

    /// Human-readable diagnostic text: captured output, else the failure kind
    pub fn diagnostics(&self) -> String {
        let text = self.output.text();
        if text.is_empty() {
            self.kind.to_string()
        } else {
            format!("{} ({})", text, self.kind)
        }
    }
}

impl From<Unavailable> for FlashError {
    fn from(u: Unavailable) -> Self {
        match u.kind {
            UnavailableKind::NotInstalled => FlashError::Unavailable {
                reason: u.kind.to_string(),
                command: u.command,
            },
            _ => FlashError::CommandFailed {
                diagnostics: u.diagnostics(),
                command: u.command,
            },
        }
    }
}

/// Outcome of a single command
pub type ProbeResult = std::result::Result<RawOutput, Unavailable>;

/// Executes invocations. Implementations must never panic on a missing tool
/// or a disconnected device.
pub trait Transport: Send + Sync {
    /// Run one command to completion (or timeout)
    fn run(&self, invocation: &Invocation) -> ProbeResult;

    /// Whether an external program is available
    fn is_installed(&self, program: &str) -> bool;
}

/// List connected devices on one backend
pub fn probe(transport: &dyn Transport, backend: Backend) -> ProbeResult {
    transport.run(&Invocation::backend(backend, backend.list_args().iter().copied()))
}

// =============================================================================
// Process-backed transport
// =============================================================================

/// Transport that spawns real processes
#[derive(Debug, Clone)]
pub struct SystemTransport {
    tools: ToolsConfig,
    probe_timeout: Duration,
}

impl SystemTransport {
    pub fn new(tools: ToolsConfig) -> Self {
        Self {
            tools,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    /// Replace the default timeout of short read-only commands
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn timeout_for(&self, invocation: &Invocation) -> Duration {
        if invocation.timeout == PROBE_TIMEOUT {
            self.probe_timeout
        } else {
            invocation.timeout
        }
    }

    fn resolve(&self, program: &Program) -> String {
        match program {
            Program::Backend(Backend::Adb) => self.tools.adb.clone(),
            Program::Backend(Backend::Fastboot) => self.tools.fastboot.clone(),
            Program::Backend(Backend::UsbEnum) => self.tools.usb_enum.clone(),
            Program::External(name) => name.clone(),
        }
    }
}

impl Default for SystemTransport {
    fn default() -> Self {
        Self::new(ToolsConfig::default())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl Transport for SystemTransport {
    fn run(&self, invocation: &Invocation) -> ProbeResult {
        let program = self.resolve(&invocation.program);
        trace!("$ {}", invocation);

        let mut command = Command::new(&program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = invocation.cwd {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found", program);
                return Err(Unavailable::new(
                    invocation,
                    UnavailableKind::NotInstalled,
                    RawOutput::default(),
                ));
            }
            Err(e) => {
                return Err(Unavailable::new(
                    invocation,
                    UnavailableKind::Io(e.to_string()),
                    RawOutput::default(),
                ))
            }
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let timeout = self.timeout_for(invocation);
        let started = Instant::now();

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) if started.elapsed() >= timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(UnavailableKind::TimedOut(timeout));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => break Err(UnavailableKind::Io(e.to_string())),
            }
        };

        let output = RawOutput::new(
            stdout.join().unwrap_or_default(),
            stderr.join().unwrap_or_default(),
        );

        match status {
            Ok(status) if status.success() => Ok(output),
            Ok(status) => {
                debug!("`{}` exited with {:?}", invocation, status.code());
                Err(Unavailable::new(
                    invocation,
                    UnavailableKind::Exit(status.code()),
                    output,
                ))
            }
            Err(kind) => {
                debug!("`{}`: {}", invocation, kind);
                Err(Unavailable::new(invocation, kind, output))
            }
        }
    }

    fn is_installed(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::fastboot(["flash", "boot_a", "boot.img"]);
        assert_eq!(inv.to_string(), "fastboot flash boot_a boot.img");
        assert_eq!(inv.timeout, PROBE_TIMEOUT);
        let long = inv.with_timeout(FLASH_TIMEOUT);
        assert_eq!(long.timeout, FLASH_TIMEOUT);
    }

    #[test]
    fn test_mutating_classification() {
        let read_only = [
            Invocation::adb(["devices"]),
            Invocation::adb(["shell", "getprop", "ro.product.model"]),
            Invocation::adb(["shell", "dumpsys", "battery"]),
            Invocation::fastboot(["devices"]),
            Invocation::fastboot(["getvar", "unlocked"]),
            Invocation::fastboot(["fetch", "boot", "boot.img"]),
            Invocation::backend(Backend::UsbEnum, ["-l"]),
        ];
        for inv in &read_only {
            assert!(!inv.is_mutating(), "{} should be read-only", inv);
        }

        let mutating = [
            Invocation::fastboot(["flash", "boot_a", "boot.img"]),
            Invocation::fastboot(["erase", "super"]),
            Invocation::fastboot(["reboot"]),
            Invocation::adb(["reboot", "bootloader"]),
            Invocation::adb(["shell", "rm", "-rf", "/data/dalvik-cache"]),
            Invocation::external("bash", ["flash_all.sh"]),
        ];
        for inv in &mutating {
            assert!(inv.is_mutating(), "{} should be mutating", inv);
        }
    }

    #[test]
    fn test_raw_output_text_combines_streams() {
        let out = RawOutput::new("", "unlocked: no\nFinished. Total time: 0.001s\n");
        assert_eq!(out.text(), "unlocked: no\nFinished. Total time: 0.001s");

        let both = RawOutput::new("line one\n", "line two\n");
        assert_eq!(both.text(), "line one\nline two");
    }

    #[test]
    fn test_unavailable_conversion() {
        let inv = Invocation::fastboot(["flash", "boot", "boot.img"]);
        let missing = Unavailable::new(&inv, UnavailableKind::NotInstalled, RawOutput::default());
        assert!(matches!(FlashError::from(missing), FlashError::Unavailable { .. }));

        let failed = Unavailable::new(
            &inv,
            UnavailableKind::Exit(Some(1)),
            RawOutput::new("", "FAILED (remote: 'partition not found')"),
        );
        match FlashError::from(failed) {
            FlashError::CommandFailed { command, diagnostics } => {
                assert_eq!(command, "fastboot flash boot boot.img");
                assert!(diagnostics.contains("partition not found"));
                assert!(diagnostics.contains("exit code 1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_system_transport_missing_program_is_unavailable() {
        let transport = SystemTransport::default();
        let inv = Invocation::external("definitely-not-a-real-tool-9f3c", ["--version"]);
        let err = transport.run(&inv).unwrap_err();
        assert_eq!(err.kind, UnavailableKind::NotInstalled);
        assert!(!transport.is_installed("definitely-not-a-real-tool-9f3c"));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_transport_captures_output_and_exit() {
        let transport = SystemTransport::default();
        let ok = transport
            .run(&Invocation::external("sh", ["-c", "echo out; echo err >&2"]))
            .unwrap();
        assert_eq!(ok.stdout.trim(), "out");
        assert_eq!(ok.stderr.trim(), "err");

        let err = transport
            .run(&Invocation::external("sh", ["-c", "echo boom >&2; exit 3"]))
            .unwrap_err();
        assert_eq!(err.kind, UnavailableKind::Exit(Some(3)));
        assert!(err.diagnostics().contains("boom"));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_transport_timeout() {
        let transport = SystemTransport::default();
        let inv = Invocation::external("sleep", ["5"]).with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = transport.run(&inv).unwrap_err();
        assert!(matches!(err.kind, UnavailableKind::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
