//! Diagnostic and validation result models

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::LspError;
use crate::infra::lsp::protocol::LspDiagnostic;

/// A single issue reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub severity: DiagnosticSeverity,
    /// Zero-based line
    pub line: u32,
    /// Zero-based column
    pub column: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn new(
        message: impl Into<String>,
        severity: DiagnosticSeverity,
        line: u32,
        column: u32,
    ) -> Self {
        Self {
            message: message.into(),
            severity,
            line,
            column,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Convert a backend diagnostic, rejecting severities outside 1..=4.
    ///
    /// An absent severity is read as an error.
    pub fn from_lsp(diagnostic: LspDiagnostic) -> Result<Self, LspError> {
        let severity = match diagnostic.severity {
            Some(value) => DiagnosticSeverity::from_lsp(value)?,
            None => DiagnosticSeverity::Error,
        };

        Ok(Self {
            message: diagnostic.message,
            severity,
            line: diagnostic.range.start.line,
            column: diagnostic.range.start.character,
            source: diagnostic.source,
        })
    }
}

/// Severity levels (matches LSP spec)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Info = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    pub fn from_lsp(value: i64) -> Result<Self, LspError> {
        match value {
            1 => Ok(Self::Error),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Info),
            4 => Ok(Self::Hint),
            other => Err(LspError::InvalidSeverity(other)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warning => "Warning",
            Self::Info => "Info",
            Self::Hint => "Hint",
        }
    }
}

impl std::fmt::Display for DiagnosticSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of validating one file
///
/// `error` is set on failure, in which case `diagnostics` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub file_path: String,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn success(file_path: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            file_path: file_path.into(),
            diagnostics,
            error: None,
        }
    }

    pub fn failure(file_path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            diagnostics: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn count(&self, severity: DiagnosticSeverity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// Human-readable summary returned to the tool caller
    pub fn render_text(&self) -> String {
        let mut text = format!("Validation results for {}:\n", self.file_path);

        if let Some(error) = &self.error {
            let _ = writeln!(text, "Error: {}", error);
        } else if self.diagnostics.is_empty() {
            text.push_str("No issues found\n");
        } else {
            text.push_str("\nDiagnostics:\n");
            for diag in &self.diagnostics {
                let _ = writeln!(
                    text,
                    "• {} at line {}, column {}: {}",
                    diag.severity, diag.line, diag.column, diag.message
                );
                if let Some(source) = &diag.source {
                    let _ = writeln!(text, "  Source: {}", source);
                }
            }
        }

        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::lsp::{Position, Range};

    fn lsp_diag(severity: Option<i64>, line: u32, column: u32) -> LspDiagnostic {
        LspDiagnostic {
            range: Range::point(Position::new(line, column)),
            severity,
            code: None,
            source: Some("pyflakes".to_string()),
            message: "undefined name 'x'".to_string(),
        }
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(DiagnosticSeverity::from_lsp(1).unwrap().label(), "Error");
        assert_eq!(DiagnosticSeverity::from_lsp(2).unwrap().label(), "Warning");
        assert_eq!(DiagnosticSeverity::from_lsp(3).unwrap().label(), "Info");
        assert_eq!(DiagnosticSeverity::from_lsp(4).unwrap().label(), "Hint");
    }

    #[test]
    fn test_out_of_range_severity_is_rejected() {
        for value in [0, 5, -1, 42] {
            let err = DiagnosticSeverity::from_lsp(value).unwrap_err();
            assert!(matches!(err, LspError::InvalidSeverity(v) if v == value));
        }
    }

    #[test]
    fn test_from_lsp_keeps_zero_based_position() {
        let diag = Diagnostic::from_lsp(lsp_diag(Some(2), 3, 7)).unwrap();
        assert_eq!(diag.line, 3);
        assert_eq!(diag.column, 7);
        assert_eq!(diag.severity, DiagnosticSeverity::Warning);
        assert_eq!(diag.source.as_deref(), Some("pyflakes"));
    }

    #[test]
    fn test_missing_severity_reads_as_error() {
        let diag = Diagnostic::from_lsp(lsp_diag(None, 0, 0)).unwrap();
        assert_eq!(diag.severity, DiagnosticSeverity::Error);
    }

    #[test]
    fn test_render_no_issues() {
        let result = ValidationResult::success("/repo/src/a.py", vec![]);
        assert_eq!(
            result.render_text(),
            "Validation results for /repo/src/a.py:\nNo issues found\n"
        );
    }

    #[test]
    fn test_render_error() {
        let result = ValidationResult::failure("/repo/a.rb", "Unsupported file type: .rb");
        assert!(!result.is_success());
        assert_eq!(
            result.render_text(),
            "Validation results for /repo/a.rb:\nError: Unsupported file type: .rb\n"
        );
    }

    #[test]
    fn test_render_diagnostics_with_source() {
        let result = ValidationResult::success(
            "/repo/a.py",
            vec![
                Diagnostic::new("X", DiagnosticSeverity::Error, 3, 0).with_source("pylsp"),
                Diagnostic::new("unused import", DiagnosticSeverity::Hint, 0, 7),
            ],
        );
        let text = result.render_text();
        assert!(text.contains("\nDiagnostics:\n"));
        assert!(text.contains("• Error at line 3, column 0: X\n  Source: pylsp\n"));
        assert!(text.contains("• Hint at line 0, column 7: unused import\n"));
        assert_eq!(result.count(DiagnosticSeverity::Error), 1);
    }

    #[test]
    fn test_result_serialization_shape() {
        let result = ValidationResult::success(
            "/repo/a.py",
            vec![Diagnostic::new("X", DiagnosticSeverity::Error, 3, 0)],
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], serde_json::Value::Null);
        assert_eq!(json["diagnostics"][0]["severity"], "Error");
        assert_eq!(json["diagnostics"][0]["line"], 3);
    }
}
