//! Scripted transport for testing without a real phone
//!
//! Rules match on a word prefix of the command line (`"fastboot flash boot"`
//! matches `fastboot flash boot boot.img` but not `fastboot flash boot_a ...`).
//! The first matching rule with uses left answers; unmatched commands get the
//! fallback response. Every invocation is recorded so tests can assert on
//! exactly what would have been sent to the device.

use crate::device::transport::{
    Invocation, ProbeResult, RawOutput, Transport, Unavailable, UnavailableKind,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Side effect run when a rule answers (e.g. create files a tool would write)
pub type MockEffect = Arc<dyn Fn(&Invocation) + Send + Sync>;

/// What a rule answers with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    Output(RawOutput),
    Failure {
        kind: UnavailableKind,
        output: RawOutput,
    },
}

impl MockResponse {
    fn to_result(&self, invocation: &Invocation) -> ProbeResult {
        match self {
            MockResponse::Output(out) => Ok(out.clone()),
            MockResponse::Failure { kind, output } => {
                Err(Unavailable::new(invocation, kind.clone(), output.clone()))
            }
        }
    }
}

struct Rule {
    words: Vec<String>,
    response: MockResponse,
    effect: Option<MockEffect>,
    uses: Option<usize>,
}

impl Rule {
    fn matches(&self, words: &[&str]) -> bool {
        self.words.len() <= words.len() && self.words.iter().zip(words).all(|(a, b)| a == b)
    }
}

/// Transport that answers from a rule table
pub struct MockTransport {
    rules: Vec<Rule>,
    remaining: Mutex<Vec<Option<usize>>>,
    fallback: MockResponse,
    installed: HashSet<String>,
    calls: Mutex<Vec<Invocation>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Unmatched commands succeed with empty output
    pub fn new() -> Self {
        Self::with_fallback(MockResponse::Output(RawOutput::default()))
    }

    /// Unmatched commands behave as if the program were not installed
    pub fn strict() -> Self {
        Self::with_fallback(MockResponse::Failure {
            kind: UnavailableKind::NotInstalled,
            output: RawOutput::default(),
        })
    }

    fn with_fallback(fallback: MockResponse) -> Self {
        Self {
            rules: Vec::new(),
            remaining: Mutex::new(Vec::new()),
            fallback,
            installed: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn push(mut self, pattern: &str, response: MockResponse, uses: Option<usize>) -> Self {
        self.rules.push(Rule {
            words: pattern.split_whitespace().map(str::to_string).collect(),
            response,
            effect: None,
            uses,
        });
        self.remaining
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(uses);
        self
    }

    /// Answer with stdout
    pub fn respond(self, pattern: &str, stdout: &str) -> Self {
        self.push(pattern, MockResponse::Output(RawOutput::new(stdout, "")), None)
    }

    /// Answer with stderr (bootloader `getvar` style)
    pub fn respond_stderr(self, pattern: &str, stderr: &str) -> Self {
        self.push(pattern, MockResponse::Output(RawOutput::new("", stderr)), None)
    }

    /// Answer with stdout for the next `times` matches only
    pub fn respond_times(self, pattern: &str, stdout: &str, times: usize) -> Self {
        self.push(
            pattern,
            MockResponse::Output(RawOutput::new(stdout, "")),
            Some(times),
        )
    }

    /// Exit 1 with a generic remote failure
    pub fn fail(self, pattern: &str) -> Self {
        self.fail_with(pattern, "FAILED (remote: 'command rejected')")
    }

    /// Exit 1 with the given stderr
    pub fn fail_with(self, pattern: &str, stderr: &str) -> Self {
        self.push(
            pattern,
            MockResponse::Failure {
                kind: UnavailableKind::Exit(Some(1)),
                output: RawOutput::new("", stderr),
            },
            None,
        )
    }

    /// Exit 1 with the given stdout
    pub fn fail_stdout(self, pattern: &str, stdout: &str) -> Self {
        self.push(
            pattern,
            MockResponse::Failure {
                kind: UnavailableKind::Exit(Some(1)),
                output: RawOutput::new(stdout, ""),
            },
            None,
        )
    }

    /// Killed after its timeout
    pub fn time_out(self, pattern: &str) -> Self {
        self.push(
            pattern,
            MockResponse::Failure {
                kind: UnavailableKind::TimedOut(Duration::from_secs(300)),
                output: RawOutput::default(),
            },
            None,
        )
    }

    /// Program missing
    pub fn unavailable(self, pattern: &str) -> Self {
        self.push(
            pattern,
            MockResponse::Failure {
                kind: UnavailableKind::NotInstalled,
                output: RawOutput::default(),
            },
            None,
        )
    }

    /// Succeed and run `effect` with the invocation
    pub fn on_run<F>(mut self, pattern: &str, effect: F) -> Self
    where
        F: Fn(&Invocation) + Send + Sync + 'static,
    {
        self = self.push(pattern, MockResponse::Output(RawOutput::default()), None);
        if let Some(rule) = self.rules.last_mut() {
            rule.effect = Some(Arc::new(effect));
        }
        self
    }

    /// Report `program` as present for `is_installed`
    pub fn installed(mut self, program: &str) -> Self {
        self.installed.insert(program.to_string());
        self
    }

    /// Every invocation received, in order
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Invocations as command lines
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.to_string()).collect()
    }

    /// Invocations that could have changed device state
    pub fn mutating_calls(&self) -> Vec<Invocation> {
        self.calls().into_iter().filter(|c| c.is_mutating()).collect()
    }

    /// Number of invocations matching a word-prefix pattern
    pub fn count(&self, pattern: &str) -> usize {
        let want: Vec<&str> = pattern.split_whitespace().collect();
        self.calls()
            .iter()
            .filter(|c| {
                let words = c.words();
                want.len() <= words.len() && want.iter().zip(&words).all(|(a, b)| a == b)
            })
            .count()
    }

    /// Forget recorded invocations
    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

impl Transport for MockTransport {
    fn run(&self, invocation: &Invocation) -> ProbeResult {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }

        let words = invocation.words();
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());

        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.matches(&words) {
                continue;
            }
            match remaining.get_mut(index) {
                Some(Some(0)) => continue,
                Some(Some(left)) => *left -= 1,
                _ => {}
            }
            if let Some(ref effect) = rule.effect {
                effect(invocation);
            }
            return rule.response.to_result(invocation);
        }

        self.fallback.to_result(invocation)
    }

    fn is_installed(&self, program: &str) -> bool {
        self.installed.contains(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_prefix_matching() {
        let mock = MockTransport::new().fail("fastboot flash boot");
        assert!(mock
            .run(&Invocation::fastboot(["flash", "boot", "boot.img"]))
            .is_err());
        assert!(mock
            .run(&Invocation::fastboot(["flash", "boot_a", "boot.img"]))
            .is_ok());
        assert_eq!(mock.calls().len(), 2);
        assert_eq!(mock.count("fastboot flash"), 2);
        assert_eq!(mock.count("fastboot flash boot"), 1);
    }

    #[test]
    fn test_first_rule_wins() {
        let mock = MockTransport::new()
            .respond("adb shell getprop ro.product.model", "Redmi")
            .respond("adb shell getprop", "generic");
        let model = mock
            .run(&Invocation::adb(["shell", "getprop", "ro.product.model"]))
            .unwrap();
        let other = mock
            .run(&Invocation::adb(["shell", "getprop", "ro.product.brand"]))
            .unwrap();
        assert_eq!(model.stdout, "Redmi");
        assert_eq!(other.stdout, "generic");
    }

    #[test]
    fn test_limited_uses_fall_through() {
        let mock = MockTransport::strict()
            .respond_times("adb devices", "List of devices attached\nA\tdevice\n", 1)
            .respond("adb devices", "List of devices attached\n");
        let first = mock.run(&Invocation::adb(["devices"])).unwrap();
        let second = mock.run(&Invocation::adb(["devices"])).unwrap();
        assert!(first.stdout.contains("A\tdevice"));
        assert!(!second.stdout.contains("A\tdevice"));
    }

    #[test]
    fn test_strict_fallback_is_not_installed() {
        let mock = MockTransport::strict();
        let err = mock.run(&Invocation::fastboot(["devices"])).unwrap_err();
        assert_eq!(err.kind, UnavailableKind::NotInstalled);
    }

    #[test]
    fn test_effect_and_installed() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let mock = MockTransport::new()
            .installed("payload-dumper-go")
            .on_run("payload-dumper-go", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        mock.run(&Invocation::external("payload-dumper-go", ["-o", "out", "payload.bin"]))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(mock.is_installed("payload-dumper-go"));
        assert!(!mock.is_installed("payload_dumper"));
    }

    #[test]
    fn test_mutating_accounting() {
        let mock = MockTransport::new();
        mock.run(&Invocation::fastboot(["getvar", "unlocked"])).unwrap();
        mock.run(&Invocation::fastboot(["erase", "cache"])).unwrap();
        let mutating = mock.mutating_calls();
        assert_eq!(mutating.len(), 1);
        assert_eq!(mutating[0].to_string(), "fastboot erase cache");
        mock.clear_calls();
        assert!(mock.calls().is_empty());
    }
}
