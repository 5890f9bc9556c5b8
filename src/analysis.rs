//! Interfaces of the analysis collaborators.
//!
//! The orchestrator never looks inside a parsed tree; everything it needs
//! from the language frontend goes through the [`Analysis`] trait, and module
//! name resolution goes through [`ModuleFinder`]. Import statements are the
//! one piece of frontend data the orchestrator interprets itself, via the
//! [`ImportNode`] variants.

use crate::{config::Options, config::SearchPaths, fscache::FileSystemCache, report::Reporter};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::PathBuf,
};

/// The shared module map: every parsed or cache-loaded tree, keyed by module
/// ID. Passes look up peers here instead of holding references to each other.
pub type Modules<T> = HashMap<String, T>;

// Priorities used for imports. (Here, top-level includes inside a class.)
// They determine a more predictable order in which the nodes of an import
// cycle are processed: when the same dependency is imported several times the
// minimum observed priority wins, and within an SCC arcs at the maximum
// priority are dropped first when reducing the cycle to a DAG.

/// Top-level `from x import y`.
pub const PRI_HIGH: u8 = 5;
/// Top-level `import x`.
pub const PRI_MED: u8 = 10;
/// Either form inside a function body.
pub const PRI_LOW: u8 = 20;
/// Import guarded by a type-checking-only conditional.
pub const PRI_GUARDED: u8 = 25;
/// A dependency synthesized by the type checker.
pub const PRI_INDIRECT: u8 = 30;
/// Sentinel including all priorities.
pub const PRI_ALL: u8 = 99;

/// Compute the effective priority of an import occurrence.
pub fn import_priority(top_level: bool, guarded: bool, toplevel_priority: u8) -> u8 {
    if !top_level {
        return PRI_LOW;
    }
    if guarded {
        return PRI_GUARDED.max(toplevel_priority);
    }
    toplevel_priority
}

/// An import statement as reported by the frontend.
///
/// The three shapes a statement can take share the flags that drive priority
/// assignment; the enumerate operation below is specialised per variant.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ImportNode {
    /// `import a.b, c`
    Import {
        ids: Vec<String>,
        line: u64,
        top_level: bool,
        guarded: bool,
        unreachable: bool,
    },
    /// `from ..pkg.mod import x, y` — `relative` counts the leading dots.
    ImportFrom {
        id: String,
        relative: u32,
        names: Vec<String>,
        line: u64,
        top_level: bool,
        guarded: bool,
        unreachable: bool,
    },
    /// `from pkg import *`
    ImportAll {
        id: String,
        relative: u32,
        line: u64,
        top_level: bool,
        guarded: bool,
        unreachable: bool,
    },
}

/// A relative import that reaches above the top-level package.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("No parent module -- cannot perform relative import")]
pub struct NoParentModule {
    pub line: u64,
}

impl ImportNode {
    pub fn line(&self) -> u64 {
        match self {
            ImportNode::Import { line, .. }
            | ImportNode::ImportFrom { line, .. }
            | ImportNode::ImportAll { line, .. } => *line,
        }
    }

    pub fn is_top_level(&self) -> bool {
        match self {
            ImportNode::Import { top_level, .. }
            | ImportNode::ImportFrom { top_level, .. }
            | ImportNode::ImportAll { top_level, .. } => *top_level,
        }
    }

    pub fn is_guarded(&self) -> bool {
        match self {
            ImportNode::Import { guarded, .. }
            | ImportNode::ImportFrom { guarded, .. }
            | ImportNode::ImportAll { guarded, .. } => *guarded,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        match self {
            ImportNode::Import { unreachable, .. }
            | ImportNode::ImportFrom { unreachable, .. }
            | ImportNode::ImportAll { unreachable, .. } => *unreachable,
        }
    }

    fn priority(&self, toplevel_priority: u8) -> u8 {
        import_priority(self.is_top_level(), self.is_guarded(), toplevel_priority)
    }

    /// Resolve a relative target against the importing file.
    ///
    /// `file_id` is the dotted name of the importing module and
    /// `file_is_package` whether it is a package `__init__` file (whose own
    /// name already counts as one level).
    fn correct_relative(
        &self,
        id: &str,
        relative: u32,
        file_id: &str,
        file_is_package: bool,
    ) -> Result<String, NoParentModule> {
        if relative == 0 {
            return Ok(id.to_string());
        }
        let mut rel = relative;
        if file_is_package {
            rel -= 1;
        }
        let mut base = file_id.to_string();
        if rel != 0 {
            let parts: Vec<&str> = base.split('.').collect();
            let keep = parts.len().saturating_sub(rel as usize);
            base = parts[..keep].join(".");
        }
        // When the dots out-number the package depth but a trailing name is
        // present, this yields a leading-dot name that no finder will ever
        // resolve; the import then lands in the suppressed list like any
        // other unresolvable target. Only a fully empty result is a blocker.
        let new_id = if id.is_empty() { base } else { format!("{base}.{id}") };
        if new_id.is_empty() {
            return Err(NoParentModule { line: self.line() });
        }
        Ok(new_id)
    }

    /// Enumerate `(priority, module id, line)` for every module this
    /// statement makes the file depend on, appending to `out`.
    ///
    /// For plain imports the target is appended before its ancestor packages
    /// so that a finder which learns about the target can prime its knowledge
    /// of the ancestors. For from-imports, names that resolve to submodules
    /// are included, and when every imported name is a submodule the
    /// dependency on the source module itself is demoted to a low priority.
    pub fn imported_ids(
        &self,
        file_id: &str,
        file_is_package: bool,
        is_module: &mut dyn FnMut(&str) -> bool,
        out: &mut Vec<(u8, String, u64)>,
    ) -> Result<(), NoParentModule> {
        match self {
            ImportNode::Import { ids, line, .. } => {
                let pri = self.priority(PRI_MED);
                let ancestor_pri = self.priority(PRI_LOW);
                for id in ids {
                    out.push((pri, id.clone(), *line));
                    let parts: Vec<&str> = id.split('.').collect();
                    let mut ancestor = String::new();
                    for part in &parts[..parts.len() - 1] {
                        if !ancestor.is_empty() {
                            ancestor.push('.');
                        }
                        ancestor.push_str(part);
                        out.push((ancestor_pri, ancestor.clone(), *line));
                    }
                }
            }
            ImportNode::ImportFrom { id, relative, names, line, .. } => {
                let cur_id = self.correct_relative(id, *relative, file_id, file_is_package)?;
                let pos = out.len();
                let mut all_are_submodules = true;
                let sub_pri = self.priority(PRI_MED);
                for name in names {
                    let sub_id = format!("{cur_id}.{name}");
                    if is_module(&sub_id) {
                        out.push((sub_pri, sub_id, *line));
                    } else {
                        all_are_submodules = false;
                    }
                }
                // The source module is a dependency even if every imported
                // name is a submodule, but in that case at a lower priority.
                let pri = self.priority(if all_are_submodules { PRI_LOW } else { PRI_HIGH });
                out.insert(pos, (pri, cur_id, *line));
            }
            ImportNode::ImportAll { id, relative, line, .. } => {
                let cur_id = self.correct_relative(id, *relative, file_id, file_is_package)?;
                out.push((self.priority(PRI_HIGH), cur_id, *line));
            }
        }
        Ok(())
    }
}

/// The language frontend: parser, semantic analyzers and type checker,
/// bundled behind one trait so the orchestrator can drive them without
/// knowing the language.
///
/// Contract notes:
///   - `parse` runs the first semantic pass as well (top-level definitions
///     enter the tree's own symbol table); parse failures are reported to the
///     `reporter` as blockers and still return a (possibly empty) tree.
///   - `Tree` serialization must be deterministic: byte-identical source and
///     identical options must serialize to identical bytes, since the
///     interface hash is a digest over the serialized form.
///   - `type_check_second` returns whether the pass produced more deferred
///     work; the scheduler iterates the whole SCC until every node reports
///     quiescence.
pub trait Analysis {
    type Tree: Serialize + DeserializeOwned + fmt::Debug;
    type Patch;

    /// Versions and content hashes of active plugins,
    /// `{module name: "<version>:<digest>"}`. Any change invalidates all
    /// cached metadata.
    fn plugins_snapshot(&self) -> BTreeMap<String, String>;

    fn parse(
        &mut self,
        id: &str,
        path: &str,
        source: &str,
        ignore_errors: bool,
        reporter: &mut Reporter,
    ) -> Self::Tree;

    /// All import statements of the file, reachable or not.
    fn imports(&self, tree: &Self::Tree) -> Vec<ImportNode>;

    /// Source lines carrying an ignore comment.
    fn ignored_lines(&self, tree: &Self::Tree) -> BTreeSet<u64>;

    /// Whether the tree is a package stub that admits arbitrary submodules.
    fn is_partial_stub_package(&self, tree: &Self::Tree) -> bool;

    /// Re-link deferred symbol references against the live module map after a
    /// tree was loaded from cache.
    fn fix_cross_refs(&mut self, id: &str, modules: &mut Modules<Self::Tree>, allow_missing: bool);

    /// Re-inject `dep` into its parent package's namespace. Import semantics
    /// mutate the parent module, but that mutation is not persisted in the
    /// child's serialized form.
    fn patch_parent_namespace(&mut self, dep: &str, modules: &mut Modules<Self::Tree>);

    /// Add the built-in generic aliases to the `typing` module's namespace.
    fn inject_typing_aliases(&mut self, modules: &mut Modules<Self::Tree>);

    /// Name binding and scope resolution. Returns deferred patches with their
    /// ordering keys.
    fn semantic_pass_two(
        &mut self,
        id: &str,
        modules: &mut Modules<Self::Tree>,
        options: &Options,
        reporter: &mut Reporter,
    ) -> Vec<(u32, Self::Patch)>;

    /// Final resolution pass; may produce more patches.
    fn semantic_pass_three(
        &mut self,
        id: &str,
        modules: &mut Modules<Self::Tree>,
        options: &Options,
        reporter: &mut Reporter,
    ) -> Vec<(u32, Self::Patch)>;

    /// Apply patches previously returned for `id`, already sorted by key.
    fn apply_patches(
        &mut self,
        id: &str,
        patches: Vec<Self::Patch>,
        modules: &mut Modules<Self::Tree>,
    );

    fn type_check_first(
        &mut self,
        id: &str,
        modules: &mut Modules<Self::Tree>,
        options: &Options,
        reporter: &mut Reporter,
    );

    fn type_check_second(
        &mut self,
        id: &str,
        modules: &mut Modules<Self::Tree>,
        options: &Options,
        reporter: &mut Reporter,
    ) -> bool;

    /// Module references the checker encountered while checking `id`, used
    /// for indirect-dependency patching.
    fn module_refs(&mut self, id: &str) -> BTreeSet<String>;

    /// Post-type-checking hook: export inferred types, render reports.
    fn finish(
        &mut self,
        id: &str,
        modules: &mut Modules<Self::Tree>,
        options: &Options,
        reporter: &mut Reporter,
    );

    /// Fine-grained dependency triggers for `id`.
    fn fine_grained_deps(
        &mut self,
        id: &str,
        modules: &Modules<Self::Tree>,
    ) -> BTreeMap<String, BTreeSet<String>>;

    /// The global protocol-dependency map, if the checker tracks one.
    fn protocol_deps(&mut self) -> Option<BTreeMap<String, BTreeSet<String>>> {
        None
    }
}

/// Resolves dotted module names to source files.
pub trait ModuleFinder {
    /// The path `id` resolves to, or `None` if the module cannot be located.
    /// Implementations are expected to memoize.
    fn find_module(
        &mut self,
        id: &str,
        search: &SearchPaths,
        fscache: &mut FileSystemCache,
    ) -> Option<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_import(ids: &[&str]) -> ImportNode {
        ImportNode::Import {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            line: 1,
            top_level: true,
            guarded: false,
            unreachable: false,
        }
    }

    #[test]
    fn priorities_follow_context() {
        assert_eq!(import_priority(true, false, PRI_MED), PRI_MED);
        assert_eq!(import_priority(false, false, PRI_MED), PRI_LOW);
        assert_eq!(import_priority(true, true, PRI_HIGH), PRI_GUARDED);
    }

    #[test]
    fn plain_import_primes_ancestors() {
        let mut out = Vec::new();
        plain_import(&["a.b.c"]).imported_ids("m", false, &mut |_| false, &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                (PRI_MED, "a.b.c".to_string(), 1),
                (PRI_LOW, "a".to_string(), 1),
                (PRI_LOW, "a.b".to_string(), 1),
            ]
        );
    }

    #[test]
    fn from_import_demotes_pure_submodule_imports() {
        let node = ImportNode::ImportFrom {
            id: "pkg".to_string(),
            relative: 0,
            names: vec!["sub".to_string()],
            line: 4,
            top_level: true,
            guarded: false,
            unreachable: false,
        };
        let mut out = Vec::new();
        node.imported_ids("m", false, &mut |id| id == "pkg.sub", &mut out).unwrap();
        assert_eq!(
            out,
            vec![(PRI_LOW, "pkg".to_string(), 4), (PRI_MED, "pkg.sub".to_string(), 4)]
        );

        let mut out = Vec::new();
        node.imported_ids("m", false, &mut |_| false, &mut out).unwrap();
        assert_eq!(out, vec![(PRI_HIGH, "pkg".to_string(), 4)]);
    }

    #[test]
    fn relative_imports_resolve_against_the_package() {
        let node = ImportNode::ImportAll {
            id: "util".to_string(),
            relative: 1,
            line: 2,
            top_level: true,
            guarded: false,
            unreachable: false,
        };
        let mut out = Vec::new();
        node.imported_ids("pkg.mod", false, &mut |_| false, &mut out).unwrap();
        assert_eq!(out, vec![(PRI_HIGH, "pkg.util".to_string(), 2)]);

        // From a package __init__ file one level less is stripped.
        let mut out = Vec::new();
        node.imported_ids("pkg.sub", true, &mut |_| false, &mut out).unwrap();
        assert_eq!(out, vec![(PRI_HIGH, "pkg.sub.util".to_string(), 2)]);
    }

    #[test]
    fn relative_import_above_root_is_rejected() {
        let node = ImportNode::ImportAll {
            id: String::new(),
            relative: 3,
            line: 7,
            top_level: true,
            guarded: false,
            unreachable: false,
        };
        let err = node.imported_ids("pkg.mod", false, &mut |_| false, &mut Vec::new());
        assert_eq!(err.unwrap_err(), NoParentModule { line: 7 });
    }

    #[test]
    fn dot_overflow_with_a_named_target_degrades_to_an_unresolvable_id() {
        // Three dots in a module only two packages deep: not a blocker, the
        // leading-dot name simply never resolves and gets suppressed.
        let node = ImportNode::ImportFrom {
            id: "foo".to_string(),
            relative: 3,
            names: vec!["bar".to_string()],
            line: 5,
            top_level: true,
            guarded: false,
            unreachable: false,
        };
        let mut out = Vec::new();
        node.imported_ids("pkg.mod", false, &mut |_| false, &mut out).unwrap();
        assert_eq!(out, vec![(PRI_HIGH, ".foo".to_string(), 5)]);
    }
}
