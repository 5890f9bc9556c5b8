//! Diagnostic collection and streaming.
//!
//! The reporter is the single write-only channel shared by every pass. It
//! accumulates diagnostics per file, suppresses messages on ignored lines,
//! tracks blockers, and hands formatted batches to the orchestrator which
//! flushes them at SCC boundaries so file-local context stays together.

use crate::error::CompileError;
use std::collections::{BTreeSet, HashMap, HashSet};
use yansi::Paint;

/// Diagnostic severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        }
    }

    fn painted(self) -> String {
        match self {
            Severity::Error => Paint::red(self.label()).bold().to_string(),
            Severity::Warning => Paint::yellow(self.label()).to_string(),
            Severity::Note => Paint::cyan(self.label()).to_string(),
        }
    }
}

#[derive(Clone, Debug)]
struct Diagnostic {
    import_context: Vec<(String, u64)>,
    file: String,
    line: i64,
    severity: Severity,
    message: String,
    blocker: bool,
}

/// Collects diagnostics for the whole build.
#[derive(Debug, Default)]
pub struct Reporter {
    /// Path prefix stripped from file names in rendered messages.
    ignore_prefix: Option<String>,
    /// Diagnostics not yet handed out via `file_messages`/`new_messages`.
    pending: Vec<Diagnostic>,
    /// Total number of diagnostics ever recorded.
    total: usize,
    file: Option<String>,
    module: Option<String>,
    import_context: Vec<(String, u64)>,
    /// Lines with an ignore comment, per file.
    ignored_lines: HashMap<String, BTreeSet<u64>>,
    /// Ignored lines that actually suppressed something, per file.
    used_ignores: HashMap<String, BTreeSet<u64>>,
    /// Files whose non-blocking diagnostics are discarded wholesale.
    ignored_files: HashSet<String>,
    /// Files with at least one error-severity diagnostic.
    error_files: HashSet<String>,
    only_once_seen: HashSet<String>,
    has_blockers: bool,
    blocker_module: Option<String>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip `prefix` from file names when rendering messages.
    pub fn set_ignore_prefix(&mut self, prefix: impl Into<String>) {
        let mut prefix = prefix.into();
        if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
            prefix.push(std::path::MAIN_SEPARATOR);
        }
        self.ignore_prefix = Some(prefix);
    }

    /// Set the file (and module) subsequent reports are attributed to.
    pub fn set_file(&mut self, file: impl Into<String>, module: Option<&str>) {
        self.file = Some(file.into());
        self.module = module.map(str::to_string);
    }

    /// Record which lines of `file` carry an ignore comment, and whether the
    /// whole file's diagnostics are to be discarded.
    pub fn set_file_ignored_lines(
        &mut self,
        file: &str,
        lines: BTreeSet<u64>,
        ignore_all: bool,
    ) {
        self.ignored_lines.insert(file.to_string(), lines);
        if ignore_all {
            self.ignored_files.insert(file.to_string());
        }
    }

    pub fn import_context(&self) -> Vec<(String, u64)> {
        self.import_context.clone()
    }

    pub fn set_import_context(&mut self, context: Vec<(String, u64)>) {
        self.import_context = context;
    }

    /// Record a diagnostic against the current file.
    ///
    /// A negative `line` means the message is not tied to a location.
    pub fn report(
        &mut self,
        line: i64,
        message: impl Into<String>,
        severity: Severity,
        blocker: bool,
        only_once: bool,
    ) {
        let message = message.into();
        let file = self.file.clone().unwrap_or_else(|| "<unknown>".to_string());

        if !blocker {
            if self.ignored_files.contains(&file) {
                return;
            }
            if line >= 0 {
                if let Some(ignored) = self.ignored_lines.get(&file) {
                    if ignored.contains(&(line as u64)) {
                        self.used_ignores.entry(file).or_default().insert(line as u64);
                        return;
                    }
                }
            }
        }
        if only_once && !self.only_once_seen.insert(message.clone()) {
            return;
        }
        if blocker {
            self.has_blockers = true;
            if self.blocker_module.is_none() {
                self.blocker_module = self.module.clone();
            }
        }
        if severity == Severity::Error {
            self.error_files.insert(file.clone());
        }
        self.total += 1;
        self.pending.push(Diagnostic {
            import_context: self.import_context.clone(),
            file,
            line,
            severity,
            message,
            blocker,
        });
    }

    pub fn is_blockers(&self) -> bool {
        self.has_blockers
    }

    pub fn is_errors(&self) -> bool {
        !self.error_files.is_empty()
    }

    /// Whether `file` produced at least one error-severity diagnostic.
    pub fn is_errors_for_file(&self, file: &str) -> bool {
        self.error_files.contains(file)
    }

    /// Total number of diagnostics recorded so far, flushed or not.
    pub fn num_messages(&self) -> usize {
        self.total
    }

    /// Build the blocking failure carrying everything not yet flushed.
    pub fn compile_error(&mut self) -> CompileError {
        CompileError {
            messages: self.new_messages(),
            use_stdout: true,
            module_with_blocker: self.blocker_module.clone(),
        }
    }

    /// Drain and format the pending diagnostics for one file.
    pub fn file_messages(&mut self, file: &str) -> Vec<String> {
        let (matching, rest) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|info| info.file == file);
        self.pending = rest;
        self.render(matching)
    }

    /// Drain and format all pending diagnostics.
    pub fn new_messages(&mut self) -> Vec<String> {
        let drained = std::mem::take(&mut self.pending);
        self.render(drained)
    }

    /// Emit error diagnostics for ignore comments that never suppressed
    /// anything in `file`.
    pub fn generate_unused_ignore_notes(&mut self, file: &str) {
        if self.ignored_files.contains(file) {
            return;
        }
        let ignored = self.ignored_lines.get(file).cloned().unwrap_or_default();
        let used = self.used_ignores.get(file).cloned().unwrap_or_default();
        for line in ignored.difference(&used) {
            // Bypasses suppression: an ignore comment cannot hide its own
            // unused-ignore diagnostic.
            self.total += 1;
            self.error_files.insert(file.to_string());
            self.pending.push(Diagnostic {
                import_context: Vec::new(),
                file: file.to_string(),
                line: *line as i64,
                severity: Severity::Error,
                message: "unused ignore comment".to_string(),
                blocker: false,
            });
        }
    }

    fn render(&self, mut infos: Vec<Diagnostic>) -> Vec<String> {
        infos.sort_by_key(|info| info.line.max(0));
        let mut out = Vec::with_capacity(infos.len());
        let mut last_context: Vec<(String, u64)> = Vec::new();
        for info in infos {
            if info.import_context != last_context {
                for (path, line) in &info.import_context {
                    out.push(format!(
                        "In module imported from {}:{}:",
                        self.strip_prefix(path),
                        line
                    ));
                }
                last_context = info.import_context.clone();
            }
            let file = self.strip_prefix(&info.file);
            let severity = info.severity.painted();
            if info.line >= 0 {
                out.push(format!("{}:{}: {}: {}", file, info.line, severity, info.message));
            } else {
                out.push(format!("{}: {}: {}", file, severity, info.message));
            }
        }
        out
    }

    fn strip_prefix<'a>(&self, file: &'a str) -> &'a str {
        match &self.ignore_prefix {
            Some(prefix) => file.strip_prefix(prefix.as_str()).unwrap_or(file),
            None => file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> Reporter {
        Paint::disable();
        Reporter::new()
    }

    #[test]
    fn ignored_lines_suppress_and_are_tracked() {
        let mut reporter = quiet();
        reporter.set_file("m.py", Some("m"));
        reporter.set_file_ignored_lines("m.py", BTreeSet::from([3, 9]), false);

        reporter.report(3, "bad type", Severity::Error, false, false);
        assert!(!reporter.is_errors_for_file("m.py"));
        assert!(reporter.file_messages("m.py").is_empty());

        reporter.generate_unused_ignore_notes("m.py");
        let messages = reporter.file_messages("m.py");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("m.py:9"));
        assert!(messages[0].contains("unused ignore comment"));
    }

    #[test]
    fn blockers_carry_the_module() {
        let mut reporter = quiet();
        reporter.set_file("pkg/mod.py", Some("pkg.mod"));
        reporter.report(1, "cannot parse", Severity::Error, true, false);
        assert!(reporter.is_blockers());

        let err = reporter.compile_error();
        assert_eq!(err.module_with_blocker.as_deref(), Some("pkg.mod"));
        assert_eq!(err.messages.len(), 1);
        assert!(err.messages[0].starts_with("pkg/mod.py:1:"));
    }

    #[test]
    fn import_context_renders_once_per_chain() {
        let mut reporter = quiet();
        reporter.set_import_context(vec![("a.py".to_string(), 4)]);
        reporter.set_file("b.py", Some("b"));
        reporter.report(2, "one", Severity::Error, false, false);
        reporter.report(5, "two", Severity::Error, false, false);

        let messages = reporter.new_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], "In module imported from a.py:4:");
    }

    #[test]
    fn only_once_messages_are_deduplicated() {
        let mut reporter = quiet();
        reporter.set_file("m.py", Some("m"));
        reporter.report(1, "see the docs", Severity::Note, false, true);
        reporter.report(7, "see the docs", Severity::Note, false, true);
        assert_eq!(reporter.new_messages().len(), 1);
    }
}
