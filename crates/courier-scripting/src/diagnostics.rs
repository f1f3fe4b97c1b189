//! In-memory diagnostic log
//!
//! Configuration-shape problems and inheritance cycles do not abort
//! orchestration. They are recorded here (and logged) while the offending
//! entry or branch is skipped.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Diagnostic category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Name collision or unusable entry in the configuration graph
    ConfigShape,
    /// Workspace inheritance loops back on itself
    InheritanceCycle,
    /// Workspace extends a name that does not exist
    UnresolvedParent,
    /// Best-effort warmup failed for one entry
    Warmup,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ConfigShape => "config-shape",
            Self::InheritanceCycle => "inheritance-cycle",
            Self::UnresolvedParent => "unresolved-parent",
            Self::Warmup => "warmup",
        };
        f.write_str(label)
    }
}

/// One recorded diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Category
    pub kind: DiagnosticKind,
    /// Workspace concerned, if any
    pub workspace: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workspace {
            Some(workspace) => write!(f, "[{}] {}: {}", self.kind, workspace, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Shared, deduplicating diagnostic log
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl Diagnostics {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic; identical entries are kept once
    pub fn record(&self, kind: DiagnosticKind, workspace: Option<&str>, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            kind,
            workspace: workspace.map(str::to_string),
            message: message.into(),
        };

        let mut entries = self.entries.lock();
        if entries.contains(&diagnostic) {
            return;
        }
        warn!(
            kind = %diagnostic.kind,
            workspace = diagnostic.workspace.as_deref().unwrap_or("-"),
            "{}",
            diagnostic.message
        );
        entries.push(diagnostic);
    }

    /// Snapshot of every recorded diagnostic
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    /// Whether any diagnostic of `kind` was recorded
    pub fn has(&self, kind: DiagnosticKind) -> bool {
        self.entries.lock().iter().any(|d| d.kind == kind)
    }

    /// Number of recorded diagnostics
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_deduplicates() {
        let diagnostics = Diagnostics::new();
        diagnostics.record(DiagnosticKind::InheritanceCycle, Some("a"), "a extends itself");
        diagnostics.record(DiagnosticKind::InheritanceCycle, Some("a"), "a extends itself");
        diagnostics.record(DiagnosticKind::ConfigShape, None, "script 'name' is reserved");

        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.has(DiagnosticKind::ConfigShape));
        assert!(!diagnostics.has(DiagnosticKind::Warmup));
        assert_eq!(
            diagnostics.entries()[0].to_string(),
            "[inheritance-cycle] a: a extends itself"
        );

        diagnostics.clear();
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let diagnostics = Diagnostics::new();
        let shared = diagnostics.clone();
        shared.record(DiagnosticKind::Warmup, None, "boom");
        assert_eq!(diagnostics.len(), 1);
    }
}
