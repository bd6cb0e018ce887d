//! Test runner for executing scenarios and generating reports
//!
//! Every scenario gets a fresh scripted transport and, for flash scenarios,
//! a throwaway source tree under the system temp directory. Nothing here
//! touches a real device.

use super::mock_transport::MockTransport;
use super::scenarios::{ExpectedResults, ScenarioAction, ScenarioLibrary, TestScenario};
use crate::core::archive::ScratchDir;
use crate::core::config::Config;
use crate::core::confirm::Forced;
use crate::core::error::{FlashError, Result};
use crate::core::flash::{FlashManager, FlashOptions, FlashSource, FlashTarget, PAYLOAD_FILE};
use crate::core::wipe;
use crate::device::detector::DeviceDetector;
use crate::device::reboot::reboot_device;
use crate::device::record::DeviceMode;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

static RUN_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Result of running a single test scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario name
    pub name: String,
    /// Whether the test passed
    pub passed: bool,
    /// Execution time
    pub duration: Duration,
    /// Commands the operation sent
    pub commands: Vec<String>,
    /// How many of them could change device state
    pub mutating: usize,
    /// Detailed message
    pub message: String,
    /// Failure reason (if any)
    pub failure_reason: Option<String>,
}

impl ScenarioResult {
    /// Create a new passing result
    pub fn passed(name: &str, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            duration,
            commands: Vec::new(),
            mutating: 0,
            message: "Test passed".to_string(),
            failure_reason: None,
        }
    }

    /// Create a new failing result
    pub fn failed(name: &str, duration: Duration, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            duration,
            commands: Vec::new(),
            mutating: 0,
            message: format!("Test failed: {}", reason),
            failure_reason: Some(reason.to_string()),
        }
    }

    /// Attach the recorded command log
    pub fn with_commands(mut self, mock: &MockTransport) -> Self {
        self.commands = mock.command_lines();
        self.mutating = mock.mutating_calls().len();
        self
    }
}

/// Summary of test run results
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestSummary {
    /// Total scenarios run
    pub total: usize,
    /// Scenarios that passed
    pub passed: usize,
    /// Scenarios that failed
    pub failed: usize,
    /// Scenarios that were skipped
    pub skipped: usize,
    /// Total execution time
    pub total_duration: Duration,
    /// Results grouped by tag
    pub results_by_tag: HashMap<String, Vec<ScenarioResult>>,
}

impl TestSummary {
    /// Calculate pass rate as percentage
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.passed as f64 / self.total as f64) * 100.0
        }
    }

    /// Get all failed scenario names
    pub fn failed_scenarios(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .results_by_tag
            .values()
            .flatten()
            .filter(|r| !r.passed)
            .map(|r| r.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Configuration for test runner
#[derive(Debug, Clone, Default)]
pub struct TestRunnerConfig {
    /// Whether to run in verbose mode
    pub verbose: bool,
    /// Whether to stop on first failure
    pub fail_fast: bool,
    /// Filter scenarios by tags
    pub tag_filter: Option<Vec<String>>,
    /// Filter scenarios by name pattern
    pub name_filter: Option<String>,
    /// Write `test_report.json` into this directory
    pub report_dir: Option<PathBuf>,
}

/// What an operation produced, before comparison with expectations
#[derive(Debug, Default)]
struct Execution {
    success: bool,
    error: Option<FlashError>,
    mode: Option<DeviceMode>,
    record: Option<serde_json::Value>,
}

impl Execution {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                ..Default::default()
            },
            Err(e) => Self {
                error: Some(e),
                ..Default::default()
            },
        }
    }
}

/// Test runner for executing scenarios
pub struct TestRunner {
    /// Configuration
    config: TestRunnerConfig,
    /// Results from test runs
    results: Vec<ScenarioResult>,
    /// Start time of test run
    start_time: Option<Instant>,
}

impl TestRunner {
    /// Create a new test runner with default configuration
    pub fn new() -> Self {
        Self::with_config(TestRunnerConfig::default())
    }

    /// Create a new test runner with configuration
    pub fn with_config(config: TestRunnerConfig) -> Self {
        Self {
            config,
            results: Vec::new(),
            start_time: None,
        }
    }

    /// Run all available scenarios
    pub fn run_all(&mut self) -> TestSummary {
        self.run_scenarios(ScenarioLibrary::all_scenarios())
    }

    /// Run quick test scenarios only
    pub fn run_quick(&mut self) -> TestSummary {
        self.run_scenarios(ScenarioLibrary::quick_scenarios())
    }

    /// Run scenarios filtered by tag
    pub fn run_by_tag(&mut self, tag: &str) -> TestSummary {
        self.run_scenarios(ScenarioLibrary::scenarios_by_tag(tag))
    }

    /// Run specific scenarios by name
    pub fn run_by_names(&mut self, names: &[&str]) -> TestSummary {
        let scenarios: Vec<_> = ScenarioLibrary::all_scenarios()
            .into_iter()
            .filter(|s| names.contains(&s.name.as_str()))
            .collect();
        self.run_scenarios(scenarios)
    }

    /// Run a list of scenarios
    pub fn run_scenarios(&mut self, scenarios: Vec<TestScenario>) -> TestSummary {
        self.start_time = Some(Instant::now());
        self.results.clear();

        let filtered = self.filter_scenarios(scenarios);
        let mut tags_by_name: HashMap<String, Vec<String>> = HashMap::new();

        if self.config.verbose {
            println!("\n╔══════════════════════════════════════════════════════════════╗");
            println!("║                MIFLASHER - SCENARIO RUNNER                   ║");
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!(
                "║  Running {} scenario(s)                                       ",
                filtered.len()
            );
            println!("╚══════════════════════════════════════════════════════════════╝\n");
        }

        for scenario in filtered {
            tags_by_name.insert(scenario.name.clone(), scenario.tags.clone());
            let result = self.run_single_scenario(scenario);

            if self.config.verbose {
                self.print_result(&result);
            }

            let should_stop = self.config.fail_fast && !result.passed;
            self.results.push(result);

            if should_stop {
                if self.config.verbose {
                    println!("\n⚠️  Stopping early due to fail-fast mode\n");
                }
                break;
            }
        }

        let summary = self.generate_summary(&tags_by_name);

        if self.config.verbose {
            self.print_summary(&summary);
        }

        if let Some(ref dir) = self.config.report_dir {
            if let Err(e) = self.write_json_report(dir, &summary) {
                log::warn!("Could not write scenario report: {}", e);
            }
        }

        summary
    }

    /// Filter scenarios based on configuration
    fn filter_scenarios(&self, scenarios: Vec<TestScenario>) -> Vec<TestScenario> {
        let mut filtered = scenarios;

        if let Some(ref tags) = self.config.tag_filter {
            filtered.retain(|s| s.tags.iter().any(|t| tags.contains(t)));
        }

        if let Some(ref pattern) = self.config.name_filter {
            let pattern_lower = pattern.to_lowercase();
            filtered.retain(|s| s.name.to_lowercase().contains(&pattern_lower));
        }

        filtered
    }

    /// Run a single scenario
    fn run_single_scenario(&self, scenario: TestScenario) -> ScenarioResult {
        let start = Instant::now();

        if self.config.verbose {
            println!("▶ Running: {} - {}", scenario.name, scenario.description);
        }

        let mock = (scenario.transport)();
        let execution = match self.execute_scenario(&scenario, &mock) {
            Ok(execution) => execution,
            Err(e) => {
                return ScenarioResult::failed(
                    &scenario.name,
                    start.elapsed(),
                    &format!("could not set up scenario: {}", e),
                )
                .with_commands(&mock)
            }
        };
        let duration = start.elapsed();

        match Self::compare_results(&execution, &mock, &scenario.expected) {
            Ok(()) => ScenarioResult::passed(&scenario.name, duration).with_commands(&mock),
            Err(reason) => {
                ScenarioResult::failed(&scenario.name, duration, &reason).with_commands(&mock)
            }
        }
    }

    /// Run the scenario's operation against its transport
    fn execute_scenario(&self, scenario: &TestScenario, mock: &MockTransport) -> Result<Execution> {
        match scenario.action {
            ScenarioAction::Detect => {
                let record = DeviceDetector::new(mock).detect();
                let mode = record.as_ref().map(|r| r.mode()).unwrap_or(DeviceMode::None);
                let record = record
                    .map(|r| serde_json::to_value(&r))
                    .transpose()
                    .map_err(|e| FlashError::Io(e.to_string()))?;
                Ok(Execution {
                    success: true,
                    error: None,
                    mode: Some(mode),
                    record,
                })
            }
            ScenarioAction::Reboot(target) => {
                Ok(Execution::from_result(reboot_device(mock, target).map(|_| ())))
            }
            ScenarioAction::Wipe(target) => match wipe::wipe(mock, &[target], &Forced) {
                Ok(report) => Ok(Execution {
                    success: report.all_succeeded(),
                    ..Default::default()
                }),
                Err(e) => Ok(Execution::from_result(Err(e))),
            },
            ScenarioAction::Flash(target) => {
                let id = RUN_COUNTER.fetch_add(1, Ordering::SeqCst);
                let workspace = ScratchDir::create(
                    &std::env::temp_dir(),
                    &format!("miflasher-sim-{}-{}-{}", std::process::id(), scenario.name, id),
                )?;
                let source = write_flash_source(workspace.path(), target)?;

                let mut config = Config::default();
                config.paths.scratch_dir = workspace.path().join("scratch");
                config.paths.download_dir = workspace.path().join("downloads");

                let result = FlashManager::new(mock, &config)
                    .flash(target, &FlashSource::Local(source), &FlashOptions::default())
                    .and_then(|outcome| outcome.check());
                Ok(Execution::from_result(result))
            }
        }
    }

    /// Compare an execution with the scenario's expectations
    fn compare_results(
        actual: &Execution,
        mock: &MockTransport,
        expected: &ExpectedResults,
    ) -> std::result::Result<(), String> {
        if actual.success != expected.should_succeed {
            return Err(match actual.error {
                Some(ref e) => format!("expected success, got error: {}", e),
                None if expected.should_succeed => "expected success, operation failed".to_string(),
                None => "expected failure, operation succeeded".to_string(),
            });
        }

        if let Some(kind) = expected.expected_error {
            match actual.error {
                Some(ref e) if e.kind() == kind => {}
                Some(ref e) => return Err(format!("expected {} error, got {}: {}", kind, e.kind(), e)),
                None => return Err(format!("expected {} error, got none", kind)),
            }
        }

        if let Some(mode) = expected.mode {
            if actual.mode != Some(mode) {
                return Err(format!(
                    "expected mode {}, got {}",
                    mode,
                    actual.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string())
                ));
            }
        }

        for (key, want) in &expected.fields {
            let got = actual
                .record
                .as_ref()
                .and_then(|r| r.get(*key))
                .and_then(|v| v.as_str());
            if got != Some(*want) {
                return Err(format!("field {}: expected {:?}, got {:?}", key, want, got));
            }
        }

        let lines: Vec<Vec<String>> = mock
            .calls()
            .iter()
            .map(|c| c.words().into_iter().map(str::to_string).collect())
            .collect();

        let mut position = 0;
        for pattern in &expected.commands {
            match lines[position..].iter().position(|words| word_prefix(pattern, words)) {
                Some(offset) => position += offset + 1,
                None => return Err(format!("missing command (in order): {}", pattern)),
            }
        }

        for pattern in &expected.forbidden {
            if lines.iter().any(|words| word_prefix(pattern, words)) {
                return Err(format!("unexpected command: {}", pattern));
            }
        }

        if let Some(max) = expected.max_mutating {
            let mutating = mock.mutating_calls();
            if mutating.len() > max {
                return Err(format!(
                    "expected at most {} mutating command(s), sent {}: {}",
                    max,
                    mutating.len(),
                    mutating.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(" | ")
                ));
            }
        }

        Ok(())
    }

    fn generate_summary(&self, tags_by_name: &HashMap<String, Vec<String>>) -> TestSummary {
        let mut summary = TestSummary {
            total: self.results.len(),
            passed: self.results.iter().filter(|r| r.passed).count(),
            failed: self.results.iter().filter(|r| !r.passed).count(),
            total_duration: self
                .start_time
                .map(|s| s.elapsed())
                .unwrap_or(Duration::ZERO),
            ..Default::default()
        };

        for result in &self.results {
            let tags = tags_by_name.get(&result.name).cloned().unwrap_or_default();
            for tag in tags {
                summary
                    .results_by_tag
                    .entry(tag)
                    .or_default()
                    .push(result.clone());
            }
        }

        summary
    }

    /// Print a single result to console
    fn print_result(&self, result: &ScenarioResult) {
        let status = if result.passed { "✓ PASS" } else { "✗ FAIL" };
        let status_color = if result.passed { "\x1b[32m" } else { "\x1b[31m" };

        println!(
            "  {}{}\x1b[0m - {} ({:.2}ms)",
            status_color,
            status,
            result.name,
            result.duration.as_secs_f64() * 1000.0
        );

        if !result.passed {
            if let Some(ref reason) = result.failure_reason {
                println!("      └─ Reason: {}", reason);
            }
            for line in &result.commands {
                println!("      │  {}", line);
            }
        } else if result.mutating > 0 {
            println!(
                "      └─ {} command(s), {} mutating",
                result.commands.len(),
                result.mutating
            );
        }
    }

    /// Print summary to console
    fn print_summary(&self, summary: &TestSummary) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                        TEST SUMMARY                          ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║  Total:    {:>4}", summary.total);
        println!("║  Passed:   {:>4} \x1b[32m✓\x1b[0m", summary.passed);
        println!("║  Failed:   {:>4} \x1b[31m✗\x1b[0m", summary.failed);
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║  Pass Rate: {:>5.1}%", summary.pass_rate());
        println!("║  Duration:  {:>5.2}s", summary.total_duration.as_secs_f64());
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        let failed = summary.failed_scenarios();
        if !failed.is_empty() {
            println!("Failed scenarios:");
            for name in failed {
                println!("  • {}", name);
            }
            println!();
        }
    }

    /// Write `test_report.json` with the summary and every result
    fn write_json_report(&self, dir: &Path, summary: &TestSummary) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join("test_report.json");
        let report = serde_json::json!({
            "summary": {
                "total": summary.total,
                "passed": summary.passed,
                "failed": summary.failed,
                "pass_rate": summary.pass_rate(),
                "duration_seconds": summary.total_duration.as_secs_f64(),
            },
            "results": self.results,
        });
        let text =
            serde_json::to_string_pretty(&report).map_err(|e| FlashError::Io(e.to_string()))?;
        fs::write(&path, text)?;

        if self.config.verbose {
            println!("📄 JSON report generated: {}", path.display());
        }
        Ok(())
    }

    /// Get all results
    pub fn results(&self) -> &[ScenarioResult] {
        &self.results
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn word_prefix(pattern: &str, words: &[String]) -> bool {
    let want: Vec<&str> = pattern.split_whitespace().collect();
    want.len() <= words.len() && want.iter().zip(words).all(|(a, b)| *a == b.as_str())
}

/// Lay out a minimal local source for `target` and return its path
fn write_flash_source(dir: &Path, target: FlashTarget) -> Result<PathBuf> {
    match target {
        FlashTarget::Rom => {
            let images = dir.join("rom").join("images");
            fs::create_dir_all(&images)?;
            fs::write(images.join("boot.img"), b"boot")?;
            fs::write(images.join("dtbo.img"), b"dtbo")?;
            Ok(dir.join("rom"))
        }
        FlashTarget::Payload => {
            let path = dir.join(PAYLOAD_FILE);
            fs::write(&path, b"CrAU")?;
            Ok(path)
        }
        other => {
            let partition = other.partition().unwrap_or("boot");
            let path = dir.join(format!("{}.img", partition));
            fs::write(&path, partition.as_bytes())?;
            Ok(path)
        }
    }
}
