//! Command-line surface: argument parsing and the format/output defaults
//! the CLI layer owns before handing off to the coordinator.

use clap::Parser;
use std::path::PathBuf;

use crate::parser::Format;

/// Render a literate Python/Markdown document, live or once.
#[derive(Parser, Debug)]
#[command(name = "knitj", version, about)]
pub struct Cli {
    /// Input file. Omit to read batch-mode input from stdin.
    #[arg(value_name = "FILE")]
    pub source: Option<PathBuf>,

    /// Run in server mode: watch `FILE` and serve a live-updating page.
    #[arg(short = 's', long = "server")]
    pub server: bool,

    /// Input format, overriding suffix-based detection.
    #[arg(short = 'f', long = "format")]
    pub format: Option<String>,

    /// Output HTML file. Server mode defaults to `FILE` with a `.html`
    /// suffix; batch mode defaults to stdout.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Jupyter kernel name. Defaults to `python3`.
    #[arg(short = 'k', long = "kernel")]
    pub kernel: Option<String>,

    /// Browser to open in server mode (as understood by the OS opener).
    #[arg(short = 'b', long = "browser")]
    pub browser: Option<String>,

    /// Do not open a browser in server mode.
    #[arg(short = 'n', long = "no-browser", conflicts_with = "browser")]
    pub no_browser: bool,

    /// Verbose logging.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// A parse/validation failure in the CLI arguments themselves, distinct
/// from the engine's own error kinds.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("-s/--server requires FILE")]
    ServerRequiresFile,
    #[error("cannot determine input format: pass -f or use a .py/.md suffix")]
    UnknownFormat,
}

impl Cli {
    /// Resolve the input format: explicit `-f`, else by suffix, else an error.
    pub fn resolve_format(&self) -> Result<Format, CliError> {
        if let Some(fmt) = &self.format {
            return match fmt.as_str() {
                "markdown" => Ok(Format::Markdown),
                "code" | "python" => Ok(Format::Code),
                _ => Err(CliError::UnknownFormat),
            };
        }
        match self.source.as_ref().and_then(|p| p.extension()) {
            Some(ext) if ext == "py" => Ok(Format::Code),
            Some(ext) if ext == "md" => Ok(Format::Markdown),
            _ => Err(CliError::UnknownFormat),
        }
    }

    /// The output path to use, applying the server-mode default of
    /// `FILE` with its suffix swapped for `.html`.
    pub fn resolve_output(&self) -> Option<PathBuf> {
        self.output.clone().or_else(|| {
            if self.server {
                self.source.as_ref().map(|p| p.with_extension("html"))
            } else {
                None
            }
        })
    }

    /// `None` means "do not open a browser"; `Some(None)` means "use the
    /// system default browser"; `Some(Some(name))` names a specific one.
    pub fn browser_choice(&self) -> Option<Option<&str>> {
        if self.no_browser {
            None
        } else {
            Some(self.browser.as_deref())
        }
    }

    pub fn validate(&self) -> Result<(), CliError> {
        if self.server && self.source.is_none() {
            return Err(CliError::ServerRequiresFile);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detected_from_py_suffix() {
        let cli = Cli {
            source: Some(PathBuf::from("doc.py")),
            server: false,
            format: None,
            output: None,
            kernel: None,
            browser: None,
            no_browser: false,
            verbose: false,
        };
        assert!(matches!(cli.resolve_format(), Ok(Format::Code)));
    }

    #[test]
    fn format_detected_from_md_suffix() {
        let cli = Cli {
            source: Some(PathBuf::from("doc.md")),
            server: false,
            format: None,
            output: None,
            kernel: None,
            browser: None,
            no_browser: false,
            verbose: false,
        };
        assert!(matches!(cli.resolve_format(), Ok(Format::Markdown)));
    }

    #[test]
    fn server_mode_without_file_fails_validation() {
        let cli = Cli {
            source: None,
            server: true,
            format: None,
            output: None,
            kernel: None,
            browser: None,
            no_browser: false,
            verbose: false,
        };
        assert!(matches!(cli.validate(), Err(CliError::ServerRequiresFile)));
    }

    #[test]
    fn server_mode_output_defaults_to_html_suffix() {
        let cli = Cli {
            source: Some(PathBuf::from("doc.py")),
            server: true,
            format: None,
            output: None,
            kernel: None,
            browser: None,
            no_browser: false,
            verbose: false,
        };
        assert_eq!(cli.resolve_output(), Some(PathBuf::from("doc.html")));
    }

    #[test]
    fn no_browser_flag_suppresses_opening() {
        let cli = Cli {
            source: Some(PathBuf::from("doc.py")),
            server: true,
            format: None,
            output: None,
            kernel: None,
            browser: None,
            no_browser: true,
            verbose: false,
        };
        assert_eq!(cli.browser_choice(), None);
    }
}
