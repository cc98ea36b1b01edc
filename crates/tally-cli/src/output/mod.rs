//! Output formatting for the tally CLI.
//!
//! JSON for scripts, or one line of `key:value` pairs per record for people.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Write};

/// Output format selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Concise `key:value` text
    #[default]
    Text,
}

impl OutputFormat {
    #[must_use]
    pub const fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Renders command results in the selected format.
#[derive(Debug, Clone, Copy, Default)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render `data` as a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn format<T: Serialize>(&self, data: &T) -> Result<String> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
            OutputFormat::Text => Ok(render_text(&serde_json::to_value(data)?)),
        }
    }

    /// Render `data` and write it to stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails
    pub fn print<T: Serialize>(&self, data: &T) -> Result<()> {
        let output = self.format(data)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{output}")?;
        Ok(())
    }
}

/// Keys printed first when present.
const LEAD_KEYS: [&str; 2] = ["entity_id", "voter_id"];

fn render_text(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let lead = LEAD_KEYS
                .iter()
                .filter_map(|key| map.get(*key).map(|val| format!("{key}:{}", render_value(val))));
            let rest = map
                .iter()
                .filter(|(key, val)| !LEAD_KEYS.contains(&key.as_str()) && !val.is_null())
                .map(|(key, val)| format!("{key}:{}", render_value(val)));
            lead.chain(rest).collect::<Vec<_>>().join("  ")
        }
        Value::Array(items) => items.iter().map(render_text).collect::<Vec<_>>().join("\n"),
        other => render_value(other),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) if s.contains(char::is_whitespace) => format!("{s:?}"),
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (_, Some(u), _) => u.to_string(),
            (_, _, Some(f)) => trim_float(f),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null => "-".to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| format!("{k}:{}", render_value(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// Scores print with at most two decimals and no trailing zeros.
fn trim_float(f: f64) -> String {
    let fixed = format!("{f:.2}");
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
