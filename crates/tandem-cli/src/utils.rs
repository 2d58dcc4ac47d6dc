//! Terminal helpers for the Tandem CLI

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::time::Duration;

/// Create a spinner progress bar
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠁", "⠂", "⠄", "⡀", "⢀", "⠠", "⠐", "⠈"])
        .template("{spinner:.green} {msg}")
    {
        pb.set_style(spinner_style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Format duration in human-readable format
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;

    if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else if seconds > 0 {
        format!("{}.{:03}s", seconds, duration.subsec_millis())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// The part of `reply` not yet shown, when it extends what was printed.
///
/// Partial replies can shrink when a heading fragment is hidden; nothing is
/// printed until the text grows past what is already on screen.
pub fn unprinted_suffix<'a>(printed: &str, reply: &'a str) -> Option<&'a str> {
    reply
        .strip_prefix(printed)
        .filter(|suffix| !suffix.is_empty())
}

/// Print formatted output (JSON or human-readable)
pub fn print_output(data: &Value, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(data)?);
    } else {
        print_nested(data, 0);
    }
    Ok(())
}

fn print_nested(data: &Value, indent: usize) {
    let prefix = "  ".repeat(indent);
    match data {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::Object(_) => {
                        println!("{}{}:", prefix, style(key).bold());
                        print_nested(value, indent + 1);
                    }
                    Value::Array(items) => {
                        println!("{}{}:", prefix, style(key).bold());
                        for (i, item) in items.iter().enumerate() {
                            println!("{}  {}: {}", prefix, i, format_value(item));
                        }
                    }
                    _ => println!("{}{}: {}", prefix, style(key).bold(), format_value(value)),
                }
            }
        }
        _ => println!("{}{}", prefix, format_value(data)),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Print warning with styling
pub fn print_warning(message: &str) {
    eprintln!("{} {}", style("Warning:").yellow().bold(), message);
}

/// Print success message with styling
pub fn print_success(message: &str) {
    println!("{} {}", style("Success:").green().bold(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30.000s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
    }

    #[test]
    fn test_unprinted_suffix() {
        assert_eq!(unprinted_suffix("", "Hi"), Some("Hi"));
        assert_eq!(unprinted_suffix("Hi", "Hi there"), Some(" there"));
        assert_eq!(unprinted_suffix("Hi there", "Hi there"), None);
        // shrank after hiding a heading fragment
        assert_eq!(unprinted_suffix("Intro.\n\nBody", "Intro."), None);
    }
}
