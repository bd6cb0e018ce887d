//! Test Database Module
//!
//! A testing framework for exercising detection and flashing without a
//! phone on the cable. The scripted [`MockTransport`] stands in for adb,
//! fastboot and the USB enumerator; scenarios pair one of those with an
//! operation and its expected result.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use miflasher::testdb::{TestRunner, TestRunnerConfig};
//!
//! // Run all quick test scenarios
//! let mut runner = TestRunner::new();
//! let summary = runner.run_quick();
//! println!("Passed: {}/{}", summary.passed, summary.total);
//!
//! // Run specific scenarios by name
//! let mut runner = TestRunner::with_config(TestRunnerConfig {
//!     verbose: true,
//!     ..Default::default()
//! });
//! let summary = runner.run_by_names(&["flash_boot", "fastboot_locked"]);
//! ```
//!
//! # Available Scenarios
//!
//! ## Detection
//! - `adb_device` - Booted phone, every field populated
//! - `adb_minimal` - Booted phone, nothing readable
//! - `recovery_device` - Recovery wins over a simultaneous fastboot answer
//! - `fastboot_locked` / `fastbootd_device` - Bootloader modes
//! - `usb_only` - Offline adb entry, USB enumerator only
//! - `no_device` - Every backend unavailable
//!
//! ## Flashing
//! - `flash_boot`, `flash_boot_single_slot`, `flash_boot_partial` - Slot fallback
//! - `flash_wrong_mode`, `flash_no_device`, `flash_payload_no_tool` - Preconditions
//! - `flash_super_erase_fails`, `flash_rom_images` - Target strategies
//!
//! ## Reboot and wipe
//! - `reboot_adb_to_bootloader`, `reboot_fastboot_to_edl`, `reboot_no_device`
//! - `wipe_cache`, `wipe_dalvik_wrong_mode`

pub mod mock_transport;
pub mod runner;
pub mod scenarios;

pub use mock_transport::{MockResponse, MockTransport};
pub use runner::{ScenarioResult, TestRunner, TestRunnerConfig, TestSummary};
pub use scenarios::{ExpectedResults, ScenarioAction, ScenarioLibrary, TestScenario};

/// Quick function to run quick tests only
pub fn run_quick_tests() -> TestSummary {
    let mut runner = TestRunner::with_config(TestRunnerConfig {
        verbose: true,
        ..Default::default()
    });
    runner.run_quick()
}

/// Get a list of all available scenario names
pub fn list_scenario_names() -> Vec<String> {
    ScenarioLibrary::all_scenarios()
        .into_iter()
        .map(|s| s.name)
        .collect()
}

/// Get a list of all available tags
pub fn list_tags() -> Vec<String> {
    let mut tags: Vec<String> = ScenarioLibrary::all_scenarios()
        .into_iter()
        .flat_map(|s| s.tags)
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

/// Print available scenarios to console
pub fn print_available_scenarios() {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║           AVAILABLE TEST SCENARIOS                           ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let scenarios = ScenarioLibrary::all_scenarios();

    // Group by first tag
    let mut by_category: std::collections::BTreeMap<String, Vec<&TestScenario>> =
        std::collections::BTreeMap::new();

    for scenario in &scenarios {
        let category = scenario
            .tags
            .first()
            .cloned()
            .unwrap_or_else(|| "other".to_string());
        by_category.entry(category).or_default().push(scenario);
    }

    for (category, scenarios) in &by_category {
        println!("📁 {}", category.to_uppercase());
        for scenario in scenarios {
            println!("   • {} - {}", scenario.name, scenario.description);
        }
        println!();
    }

    println!("Total: {} scenarios available\n", scenarios.len());
}
