//! Progress bar utilities for CLI output
//!
//! Key features:
//! - Spinners and bars that suspend cleanly when logging
//! - Consistent visual styling across all operations
//! - A stage list for the flash sequence

use crate::core::downloader::{DownloadPhase, DownloadProgress};
use crate::core::flash::{FlashPhase, FlashProgress};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Styles - Consistent visual appearance
// ============================================================================

/// Get the spinner style for waiting on the device
fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap()
        .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷")
}

/// Get the progress bar style for counted steps
fn progress_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:40.cyan/dim}] {pos}/{len} ({percent}%) {msg}")
        .unwrap()
        .progress_chars("━━╾─")
}

/// Get the progress bar style for byte transfers
fn bytes_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "  {spinner:.green} [{bar:40.cyan/dim}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        )
        .unwrap()
        .progress_chars("━━╾─")
}

/// Get the style for completed progress bars
fn completed_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  ✓ [{bar:40.green/dim}] {pos}/{len} ({percent}%) {msg}")
        .unwrap()
        .progress_chars("━━━")
}

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 68;
    let title_padded = format!("{:^width$}", title, width = width - 4);
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{}║", title_padded);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

/// Print a section divider
pub fn print_divider() {
    println!();
    println!("{}", "─".repeat(60));
    println!();
}

/// Print a success message with checkmark
pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

/// Print an info message with bullet
pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("  ⚠ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

/// Print a step in a process
pub fn print_step(step: usize, total: usize, msg: &str) {
    println!("  [{}/{}] {}", step, total, msg);
}

/// Print `label: value` rows with the labels aligned
pub fn print_rows(rows: &[(&str, String)]) {
    let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
    for (label, value) in rows {
        println!("  {:<width$}  {}", label, value, width = width);
    }
}

// ============================================================================
// Spinner for single device commands
// ============================================================================

/// Spinner shown while waiting on one command
pub struct StatusSpinner {
    spinner: ProgressBar,
    start_time: Instant,
}

impl StatusSpinner {
    pub fn new(msg: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(spinner_style());
        spinner.enable_steady_tick(Duration::from_millis(80));
        spinner.set_message(msg.to_string());

        Self {
            spinner,
            start_time: Instant::now(),
        }
    }

    pub fn set_message(&self, msg: &str) {
        self.spinner.set_message(msg.to_string());
    }

    /// Log an event message (suspends spinner automatically)
    pub fn log(&self, msg: &str) {
        self.spinner.suspend(|| {
            println!("  → {}", msg);
        });
    }

    /// Finish and clear the spinner
    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    /// Finish with a message and the elapsed time
    pub fn finish_with(&self, msg: &str) {
        self.spinner.finish_with_message(format!(
            "✓ {} ({:.1}s)",
            msg,
            self.start_time.elapsed().as_secs_f64()
        ));
    }

    pub fn finish_with_error(&self, msg: &str) {
        self.spinner.abandon_with_message(format!("✗ {}", msg));
    }
}

// ============================================================================
// Byte progress for downloads
// ============================================================================

/// Progress display for one download; switches to a bar once the size is known
pub struct DownloadBar {
    progress_bar: ProgressBar,
    sized: AtomicBool,
}

impl DownloadBar {
    pub fn new() -> Self {
        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(spinner_style());
        progress_bar.enable_steady_tick(Duration::from_millis(100));
        progress_bar.set_message("Connecting...");
        Self {
            progress_bar,
            sized: AtomicBool::new(false),
        }
    }

    /// Apply one progress report from the downloader
    pub fn update(&self, progress: &DownloadProgress) {
        if let Some(total) = progress.total {
            if !self.sized.swap(true, Ordering::SeqCst) {
                self.progress_bar.set_length(total);
                self.progress_bar.set_style(bytes_bar_style());
            }
        }
        self.progress_bar.set_position(progress.downloaded);

        match progress.phase {
            DownloadPhase::Starting { attempt, resume_from } => {
                let msg = if resume_from > 0 {
                    format!("{} (resuming at {})", progress.file_name, format_bytes(resume_from))
                } else if attempt > 1 {
                    format!("{} (attempt {})", progress.file_name, attempt)
                } else {
                    progress.file_name.clone()
                };
                self.progress_bar.set_message(msg);
            }
            DownloadPhase::Transferring => {}
            DownloadPhase::Verifying => self.progress_bar.set_message("verifying checksum..."),
            DownloadPhase::Complete => self.progress_bar.set_message("done"),
        }
    }

    pub fn log(&self, msg: &str) {
        self.progress_bar.suspend(|| {
            println!("  {}", msg);
        });
    }

    pub fn finish(&self) {
        self.progress_bar.finish();
    }

    /// Finish with an error
    pub fn finish_with_error(&self, msg: &str) {
        self.progress_bar.abandon_with_message(format!("✗ {}", msg));
    }
}

impl Default for DownloadBar {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Counted steps (backup / restore)
// ============================================================================

/// Bar over a known number of partitions
pub struct StepBar {
    progress_bar: ProgressBar,
}

impl StepBar {
    pub fn new(total: u64) -> Self {
        let progress_bar = ProgressBar::new(total);
        progress_bar.set_style(progress_bar_style());
        progress_bar.enable_steady_tick(Duration::from_millis(100));
        Self { progress_bar }
    }

    /// Move to `step` of `total` working on `item`
    pub fn update(&self, step: usize, total: usize, item: &str) {
        if self.progress_bar.length() != Some(total as u64) {
            self.progress_bar.set_length(total as u64);
        }
        self.progress_bar.set_position(step.saturating_sub(1) as u64);
        self.progress_bar.set_message(item.to_string());
    }

    pub fn finish(&self, msg: &str) {
        if let Some(len) = self.progress_bar.length() {
            self.progress_bar.set_position(len);
        }
        self.progress_bar.set_style(completed_style());
        self.progress_bar.finish_with_message(msg.to_string());
    }

    pub fn finish_with_error(&self, msg: &str) {
        self.progress_bar.abandon_with_message(format!("✗ {}", msg));
    }
}

// ============================================================================
// Multi-stage progress tracker for the flash sequence
// ============================================================================

const FLASH_STAGES: [(FlashPhase, &str); 6] = [
    (FlashPhase::Validate, "Check device mode"),
    (FlashPhase::Acquire, "Fetch source"),
    (FlashPhase::Extract, "Extract archive"),
    (FlashPhase::Execute, "Flash"),
    (FlashPhase::Cleanup, "Clean up"),
    (FlashPhase::Reboot, "Reboot"),
];

fn stage_index(phase: FlashPhase) -> usize {
    FLASH_STAGES
        .iter()
        .position(|(p, _)| *p == phase)
        .unwrap_or(0)
}

/// One line per flash stage; earlier stages tick off as later ones start
pub struct FlashStages {
    multi: MultiProgress,
    stages: Vec<ProgressBar>,
    current_stage: AtomicUsize,
}

impl FlashStages {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let stages: Vec<ProgressBar> = FLASH_STAGES
            .iter()
            .map(|(_, name)| {
                let pb = multi.add(ProgressBar::new_spinner());
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("  {spinner:.dim} {msg}")
                        .unwrap()
                        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
                );
                pb.set_message(format!("⋯ {}", name));
                pb
            })
            .collect();

        Self {
            multi,
            stages,
            current_stage: AtomicUsize::new(0),
        }
    }

    /// Apply one progress report from the flash manager
    pub fn update(&self, progress: &FlashProgress) {
        let index = stage_index(progress.phase);
        let previous = self.current_stage.swap(index, Ordering::SeqCst);
        for done in previous..index {
            self.complete_stage(done, FLASH_STAGES[done].1);
        }
        if let Some(bar) = self.stages.get(index) {
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            let msg = if progress.total > 0 {
                format!("[{}/{}] {}", progress.step, progress.total, progress.message)
            } else {
                progress.message.clone()
            };
            bar.set_message(msg);
        }
    }

    fn complete_stage(&self, index: usize, message: &str) {
        if let Some(bar) = self.stages.get(index) {
            if bar.is_finished() {
                return;
            }
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("  ✓ {msg:.green}")
                    .unwrap(),
            );
            bar.finish_with_message(message.to_string());
        }
    }

    /// Mark everything up to the current stage done and drop the rest
    pub fn finish(&self, success: bool) {
        let current = self.current_stage.load(Ordering::SeqCst);
        for (index, bar) in self.stages.iter().enumerate() {
            if index < current || (success && index == current) {
                self.complete_stage(index, FLASH_STAGES[index].1);
            } else if index == current {
                bar.set_style(
                    ProgressStyle::default_spinner()
                        .template("  ✗ {msg:.red}")
                        .unwrap(),
                );
                bar.finish_with_message(format!("{} failed", FLASH_STAGES[index].1));
            } else {
                bar.finish_and_clear();
            }
        }
    }

    /// Log a message (suspends all progress bars)
    pub fn log(&self, msg: &str) {
        self.multi.suspend(|| {
            println!("{}", msg);
        });
    }
}

impl Default for FlashStages {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

// ============================================================================
// Dual writer for file + console logging
// ============================================================================

/// A writer that writes to both console and file
///
/// Used for logging to both stderr and a log file simultaneously.
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.console.write(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}

// ============================================================================
// Tests
// ============================================================================
