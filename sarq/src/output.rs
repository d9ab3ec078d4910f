//! Output formatting for the interactive loop.
//!
//! Provides abstraction layer for reporting results in text or JSON format.
//! Reports go to stdout so they stay separable from a `stderr` archive sink.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for loop output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write output using the configured format.
    ///
    /// JSON mode emits `data` as a single JSON line; text mode prints the
    /// string produced by `text_fn`.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    writeln!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    pub fn write_error(&self, error: &anyhow::Error) {
        match self.format {
            OutputFormat::Json => {
                let output = ErrorOutput {
                    success: false,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string(&output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub error: String,
}

/// Report for one fully archived file.
#[derive(Debug, Serialize)]
pub struct FileReport {
    pub success: bool,
    pub file: String,
    /// Non-blocking steps it took to drain the file.
    pub steps: u64,
    pub millis: u128,
}
