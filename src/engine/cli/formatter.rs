//! CLI Output Formatting Module
//! Colorized terminal output for fresh-cli

use chrono::{TimeZone, Utc};
use colored::Colorize;
use std::io::Write;

use crate::engine::updater::UpdateState;

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    /// Print an engine state transition
    pub fn state(state: UpdateState, version: Option<&str>) {
        let label = match state {
            UpdateState::UpdateDownloaded => state.as_str().green().bold(),
            UpdateState::Error => state.as_str().red().bold(),
            UpdateState::UpdateNotAvailable => state.as_str().bright_black(),
            _ => state.as_str().bright_blue(),
        };
        match version {
            Some(version) => println!("  {} {} {}", "▶".bright_blue(), label, version),
            None => println!("  {} {}", "▶".bright_blue(), label),
        }
    }

    /// Redraw a download progress bar in place. `total` may be 0 when the
    /// server did not announce a length.
    pub fn transfer(done: u64, total: u64) {
        if total == 0 {
            print!("\r  {} {}", "⠋".bright_blue(), format_size(done));
        } else {
            let percentage = (done.min(total) * 100 / total) as usize;
            let filled = percentage / 5;
            print!(
                "\r  [{}{}] {:>3}% {}/{}",
                "█".repeat(filled).bright_green(),
                "░".repeat(20 - filled).bright_black(),
                percentage,
                format_size(done),
                format_size(total)
            );
        }
        std::io::stdout().flush().ok();
    }

    /// Terminate an in-place progress line
    pub fn end_transfer() {
        println!();
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Format an epoch-seconds timestamp, `never` for 0
pub fn format_timestamp(seconds: i64) -> String {
    if seconds <= 0 {
        return "never".to_string();
    }
    match Utc.timestamp_opt(seconds, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => seconds.to_string(),
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
