//! Diagnostics attached to runs, files and destroy operations.
//!
//! Test failures are data, not Rust errors: every problem the runner or the
//! engine reports becomes a [`Diagnostic`] and is folded into a status.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Kind of object an expected failure can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckableKind {
    InputVariable,
    Check,
    Output,
    Resource,
}

/// The checkable object a diagnostic was raised for, e.g. `var.region`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CheckOrigin {
    pub kind: CheckableKind,
    pub address: String,
}

impl CheckOrigin {
    pub fn variable(name: &str) -> Self {
        Self {
            kind: CheckableKind::InputVariable,
            address: format!("var.{name}"),
        }
    }

    pub fn check(name: &str) -> Self {
        Self {
            kind: CheckableKind::Check,
            address: format!("check.{name}"),
        }
    }

    pub fn output(name: &str) -> Self {
        Self {
            kind: CheckableKind::Output,
            address: format!("output.{name}"),
        }
    }

    /// `address` is the bare resource address, `type.name`.
    pub fn resource(address: &str) -> Self {
        Self {
            kind: CheckableKind::Resource,
            address: format!("resource.{address}"),
        }
    }

    /// Parse an expected-failure address such as `check.healthy`.
    pub fn parse(address: &str) -> Option<Self> {
        let (prefix, rest) = address.split_once('.')?;
        if rest.is_empty() {
            return None;
        }
        let kind = match prefix {
            "var" => CheckableKind::InputVariable,
            "check" => CheckableKind::Check,
            "output" => CheckableKind::Output,
            "resource" => {
                let (ty, name) = rest.split_once('.')?;
                if ty.is_empty() || name.is_empty() || name.contains('.') {
                    return None;
                }
                CheckableKind::Resource
            }
            _ => return None,
        };
        if kind != CheckableKind::Resource && rest.contains('.') {
            return None;
        }
        Some(Self {
            kind,
            address: address.to_string(),
        })
    }
}

impl fmt::Display for CheckOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<CheckOrigin>,
}

impl Diagnostic {
    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            summary: summary.into(),
            detail: detail.into(),
            origin: None,
        }
    }

    pub fn warning(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            summary: summary.into(),
            detail: detail.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: CheckOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Appended to a run whose engine call was still in flight when a stop or
    /// cancel request arrived.
    pub fn interrupted() -> Self {
        Self::error(
            "Test interrupted",
            "The test operation could not be completed due to an interrupt signal. \
             Please read the remaining diagnostics carefully for any sign of failed \
             state cleanup or dangling resources.",
        )
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "Error",
            Severity::Warning => "Warning",
        };
        write!(f, "{label}: {}", self.summary)?;
        if !self.detail.is_empty() {
            write!(f, "\n\n  {}", self.detail)?;
        }
        Ok(())
    }
}

/// Ordered diagnostic list with the helpers the runner needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.0.extend(other);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }

    pub fn retain(&mut self, keep: impl FnMut(&Diagnostic) -> bool) {
        self.0.retain(keep);
    }

    /// Summaries of every diagnostic, handy for assertions and logs.
    pub fn summaries(&self) -> Vec<&str> {
        self.0.iter().map(|diag| diag.summary.as_str()).collect()
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diagnostic: Diagnostic) -> Self {
        Self(vec![diagnostic])
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::warning("heads up", ""));
        assert!(!diags.has_errors());
        diags.push(Diagnostic::error("boom", "detail"));
        assert!(diags.has_errors());
        assert_eq!(diags.summaries(), vec!["heads up", "boom"]);
    }

    #[test]
    fn parses_checkable_addresses() {
        let origin = CheckOrigin::parse("var.region").expect("var address");
        assert_eq!(origin, CheckOrigin::variable("region"));

        let origin = CheckOrigin::parse("resource.sim_bucket.main").expect("resource");
        assert_eq!(origin.kind, CheckableKind::Resource);
        assert_eq!(origin, CheckOrigin::resource("sim_bucket.main"));

        assert!(CheckOrigin::parse("check.").is_none());
        assert!(CheckOrigin::parse("module.foo").is_none());
        assert!(CheckOrigin::parse("resource.only_type").is_none());
        assert!(CheckOrigin::parse("output.a.b").is_none());
    }

    #[test]
    fn display_includes_detail_when_present() {
        let rendered = Diagnostic::error("Invalid value", "must be positive").to_string();
        assert!(rendered.starts_with("Error: Invalid value"));
        assert!(rendered.contains("must be positive"));

        let rendered = Diagnostic::warning("Careful", "").to_string();
        assert_eq!(rendered, "Warning: Careful");
    }
}
