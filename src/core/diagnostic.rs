//! Diagnostics accumulated by a session.
//!
//! Every stage (parse, compile, link, execute) reports problems as
//! [`Diagnostic`] values. They are plain data: recording one never touches
//! global state, and each session keeps its own list.

use std::fmt;

/// Pipeline stage that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    Compile,
    Link,
    Execute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parse => "parse",
            Stage::Compile => "compile",
            Stage::Link => "link",
            Stage::Execute => "execute",
        };
        f.write_str(name)
    }
}

/// Whether a diagnostic stops the stage that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Error,
}

/// One-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A message tied to a stage and, when known, a source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    /// Create an error diagnostic without a location.
    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity: Severity::Error,
            message: message.into(),
            location: None,
        }
    }

    /// Create a warning diagnostic without a location.
    pub fn warning(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            severity: Severity::Warning,
            message: message.into(),
            location: None,
        }
    }

    /// Attach a source location.
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match self.location {
            Some(loc) => write!(f, "{loc}: {} {severity}: {}", self.stage, self.message),
            None => write!(f, "{} {severity}: {}", self.stage, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_location() {
        let diag = Diagnostic::error(Stage::Parse, "expected ';'").at(Location::new(3, 14));
        assert_eq!(diag.to_string(), "3:14: parse error: expected ';'");
        assert!(diag.is_error());
    }

    #[test]
    fn test_display_without_location() {
        let diag = Diagnostic::warning(Stage::Compile, "implicit declaration of 'puts'");
        assert_eq!(
            diag.to_string(),
            "compile warning: implicit declaration of 'puts'"
        );
        assert!(!diag.is_error());
    }
}
