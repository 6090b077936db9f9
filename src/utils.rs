//! # Utility Functions
//!
//! Formatting helpers for the console report and the run identifier used in result
//! metadata.
//!
//! ```rust
//! use kpi_trace::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_seconds(1.5), "1.500s");
//! assert_eq!(format_duration(Duration::from_millis(250)), "250.00ms");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of one collection run (UUID v4)
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a KPI value given in seconds
pub fn format_seconds(seconds: f64) -> String {
    format!("{:.3}s", seconds)
}

/// Format a duration with the most readable unit
///
/// - below one millisecond: microseconds
/// - below one second: milliseconds with two decimals
/// - below one minute: seconds with three decimals
/// - otherwise: minutes and seconds
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if duration < Duration::from_millis(1) {
        format!("{}µs", duration.as_micros())
    } else if duration < Duration::from_secs(1) {
        format!("{:.2}ms", secs * 1000.0)
    } else if duration < Duration::from_secs(60) {
        format!("{:.3}s", secs)
    } else {
        let minutes = duration.as_secs() / 60;
        format!("{}m {:.3}s", minutes, secs - (minutes * 60) as f64)
    }
}

/// One table row as text: `| a | b |`, each column padded to its width
pub fn format_table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Table separator matching [`format_table_row`]: `+---+---+`
pub fn format_table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    println!("{}", format_table_row(columns, widths));
}

pub fn print_table_separator(widths: &[usize]) {
    println!("{}", format_table_separator(widths));
}

/// Column widths fitting the header and every row
pub fn column_widths(header: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            let len = cell.chars().count();
            match widths.get_mut(i) {
                Some(width) => *width = (*width).max(len),
                None => widths.push(len),
            }
        }
    }
    widths
}
