//! Display utilities for the CLI

use colored::*;

use spreader_core::RunSummary;

const RULE_WIDTH: usize = 60;
const KEY_WIDTH: usize = 26;

pub fn section(title: &str) {
    let rule = "━".repeat(RULE_WIDTH);
    println!("\n{}\n {}\n{}", rule.bright_black(), title.bright_white().bold(), rule.bright_black());
}

fn line(marker: ColoredString, message: impl std::fmt::Display) {
    println!("  {} {}", marker, message);
}

pub fn success(message: &str) {
    line("✓".bright_green(), message);
}

pub fn error(message: &str) {
    line("✗".bright_red(), message.bright_red());
}

pub fn info(message: &str) {
    line("→".bright_blue(), message);
}

pub fn warning(message: &str) {
    line("⚠".yellow(), message.yellow());
}

/// Aligned key column, highlighted value
pub fn kv(key: &str, value: &str) {
    println!("    {:<width$} {}", format!("{}:", key), value.bright_cyan(), width = KEY_WIDTH);
}

/// Final report for `run`
pub fn summary(summary: &RunSummary) {
    section("Run Summary");
    kv("Rounds completed", &format!("{} / {}", summary.completed, summary.requested));
    kv("Attempts", &summary.attempts.to_string());
    kv("Stalls (nothing eligible)", &summary.stalls.to_string());
    kv("Failed attempts", &summary.failures.to_string());
    for (i, txid) in summary.transactions.iter().enumerate() {
        kv(&format!("Tx {}", i + 1), &txid.to_string());
    }
    println!();

    if summary.interrupted {
        warning("Interrupted; all entries were unlocked and staking re-enabled");
    } else if summary.completed == summary.requested {
        success("Done! All rounds completed");
    } else {
        error("Run ended before the round budget was spent");
    }
}
