//! Output formatting for CLI commands.
//!
//! Every command renders either human-readable text or a JSON document; the
//! JSON shapes are the DTOs below.

use anyhow::Result;
use serde::Serialize;
use snapvault_core::{BackupReport, ContentDigest, GcStats, Kind, PruneReport};
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
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
    /// The `text_fn` closure is called only in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr, as a JSON object in JSON mode.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init` command.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub algorithm: String,
}

/// Output for `backup` command.
#[derive(Debug, Serialize)]
pub struct BackupOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub report: BackupReport,
}

/// Output for `gc` command.
#[derive(Debug, Serialize)]
pub struct GcOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    #[serde(flatten)]
    pub stats: GcStats,
}

/// Output for `prune` command.
#[derive(Debug, Serialize)]
pub struct PruneOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub report: PruneReport,
}

/// Output for `resolve` command.
#[derive(Debug, Serialize)]
pub struct ResolveOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub kind: Kind,
    pub digest: ContentDigest,
}

/// Output for `roots list` command.
#[derive(Debug, Serialize)]
pub struct RootsListOutput {
    pub success: bool,
    pub result_code: u8,
    pub roots: Vec<String>,
}

/// Output for `roots add` and `roots rm` commands.
#[derive(Debug, Serialize)]
pub struct RootsChangeOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
}
