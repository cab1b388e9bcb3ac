//! Output formatting for CLI

use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Print rows as JSON, a table, or one `text` line per row
pub fn print_rows<T>(rows: &[T], format: &str, text: impl Fn(&T) -> String)
where
    T: Serialize + Tabled,
{
    match OutputFormat::from(format) {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string()));
        }
        OutputFormat::Table => println!("{}", Table::new(rows)),
        OutputFormat::Text => {
            for row in rows {
                println!("{}", text(row));
            }
        }
    }
}

/// Print a single value as JSON or with its text rendering
pub fn print_value<T: Serialize>(value: &T, format: &str, text: impl FnOnce(&T) -> String) {
    match OutputFormat::from(format) {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string()));
        }
        OutputFormat::Table | OutputFormat::Text => println!("{}", text(value)),
    }
}
